use std::collections::BTreeSet;

use anyhow::Context;

/// Smallest port `>= floor` not present in `used`.
///
/// Pure: the caller records the port once it commits to it.
pub fn allocate(used: &BTreeSet<u16>, floor: u16) -> anyhow::Result<u16> {
    let mut candidate = floor;
    for &port in used.range(floor..) {
        if port != candidate {
            break;
        }
        candidate = candidate
            .checked_add(1)
            .with_context(|| format!("no free port at or above {floor}"))?;
    }
    Ok(candidate)
}

/// Returns whether the port was present.
pub fn release(used: &mut BTreeSet<u16>, port: u16) -> bool {
    used.remove(&port)
}

/// One class of ports (instances or agents) with its own floor.
#[derive(Debug, Clone)]
pub struct PortPool {
    floor: u16,
    used: BTreeSet<u16>,
}

impl PortPool {
    pub fn new(floor: u16) -> Self {
        Self {
            floor,
            used: BTreeSet::new(),
        }
    }

    /// Allocates and records a port in one step.
    pub fn reserve(&mut self) -> anyhow::Result<u16> {
        let port = allocate(&self.used, self.floor)?;
        self.used.insert(port);
        Ok(port)
    }

    /// Marks a persisted port as in use. Idempotent.
    pub fn claim(&mut self, port: u16) {
        self.used.insert(port);
    }

    pub fn release(&mut self, port: u16) -> bool {
        release(&mut self.used, port)
    }

    pub fn contains(&self, port: u16) -> bool {
        self.used.contains(&port)
    }

    pub fn len(&self) -> usize {
        self.used.len()
    }

    pub fn is_empty(&self) -> bool {
        self.used.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(ports: &[u16]) -> BTreeSet<u16> {
        ports.iter().copied().collect()
    }

    #[test]
    fn empty_set_returns_floor() {
        assert_eq!(allocate(&BTreeSet::new(), 7880).unwrap(), 7880);
    }

    #[test]
    fn fills_first_gap() {
        let used = set(&[12080, 12081, 12083]);
        assert_eq!(allocate(&used, 12080).unwrap(), 12082);
    }

    #[test]
    fn appends_after_contiguous_run() {
        let used = set(&[100, 101, 102]);
        assert_eq!(allocate(&used, 100).unwrap(), 103);
    }

    #[test]
    fn ignores_ports_below_floor() {
        let used = set(&[10, 11, 50]);
        assert_eq!(allocate(&used, 50).unwrap(), 51);
        assert_eq!(allocate(&used, 12).unwrap(), 12);
    }

    #[test]
    fn matches_linear_scan() {
        let used = set(&[3, 4, 5, 7, 9, 10, 11, 20]);
        for floor in 0..25u16 {
            let expected = (floor..).find(|p| !used.contains(p)).unwrap();
            assert_eq!(allocate(&used, floor).unwrap(), expected, "floor {floor}");
        }
    }

    #[test]
    fn exhausted_range_is_an_error() {
        let used = set(&[u16::MAX - 1, u16::MAX]);
        assert!(allocate(&used, u16::MAX - 1).is_err());
    }

    #[test]
    fn allocation_never_repeats_until_released() {
        let mut used = BTreeSet::new();
        let a = allocate(&used, 7880).unwrap();
        used.insert(a);
        let b = allocate(&used, 7880).unwrap();
        assert_ne!(a, b);

        assert!(release(&mut used, a));
        assert!(!release(&mut used, a));
        assert_eq!(allocate(&used, 7880).unwrap(), a);
    }

    #[test]
    fn pools_are_independent() {
        let mut instances = PortPool::new(7880);
        let mut agents = PortPool::new(10880);
        assert_eq!(instances.reserve().unwrap(), 7880);
        assert_eq!(agents.reserve().unwrap(), 10880);
        assert_eq!(instances.reserve().unwrap(), 7881);
        assert!(!agents.contains(7881));

        instances.claim(7883);
        assert_eq!(instances.reserve().unwrap(), 7882);
        assert_eq!(instances.reserve().unwrap(), 7884);
        assert!(instances.release(7880));
        assert_eq!(instances.reserve().unwrap(), 7880);
        assert_eq!(instances.len(), 5);
    }
}
