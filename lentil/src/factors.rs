use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A mixture factor: a spatially varying expression program
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Factor {
    /// initial bias of the factor's loading logits
    pub bias: f32,
    /// initial per-gene log-rate offset (zeros when absent)
    pub profile: Option<Vec<f32>>,
}

impl Factor {
    pub fn new(bias: f32, profile: Option<Vec<f32>>) -> Self {
        Self { bias, profile }
    }
}

/// Bookkeeping of active factor ids.
///
/// New factors take the most recently removed id first (LIFO) and
/// otherwise the next value of a monotone counter.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FactorRegistry {
    active: BTreeMap<usize, Factor>,
    recycled: Vec<usize>,
    next_id: usize,
}

impl FactorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Activate a factor and return its id
    pub fn add(&mut self, factor: Factor) -> usize {
        let id = match self.recycled.pop() {
            Some(id) => id,
            None => {
                let id = self.next_id;
                self.next_id += 1;
                id
            }
        };
        debug_assert!(!self.active.contains_key(&id));
        debug!("adding new factor: {}", id);
        self.active.insert(id, factor);
        id
    }

    /// Deactivate factor `id`; its id becomes the next one handed out
    pub fn remove(&mut self, id: usize) -> anyhow::Result<Factor> {
        debug!("removing factor: {}", id);
        match self.active.remove(&id) {
            Some(factor) => {
                self.recycled.push(id);
                Ok(factor)
            }
            None => Err(anyhow::anyhow!(
                "attempted to remove factor {}, which doesn't exist",
                id
            )),
        }
    }

    pub fn contains(&self, id: usize) -> bool {
        self.active.contains_key(&id)
    }

    pub fn get(&self, id: usize) -> Option<&Factor> {
        self.active.get(&id)
    }

    /// active ids in ascending order
    pub fn ids(&self) -> Vec<usize> {
        self.active.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    /// An owned copy of the active factors; edits to it never reach
    /// the registry
    pub fn snapshot(&self) -> BTreeMap<usize, Factor> {
        self.active.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recycles_removed_id() -> anyhow::Result<()> {
        let mut reg = FactorRegistry::new();
        assert_eq!(reg.add(Factor::default()), 0);
        assert_eq!(reg.add(Factor::default()), 1);
        assert_eq!(reg.ids(), vec![0, 1]);

        reg.remove(0)?;
        assert_eq!(reg.ids(), vec![1]);

        assert_eq!(reg.add(Factor::new(0.5, None)), 0);
        assert_eq!(reg.ids(), vec![0, 1]);
        assert_eq!(reg.get(0).map(|f| f.bias), Some(0.5));

        assert_eq!(reg.add(Factor::default()), 2);
        Ok(())
    }

    #[test]
    fn test_lifo_recycling_order() -> anyhow::Result<()> {
        let mut reg = FactorRegistry::new();
        for _ in 0..4 {
            reg.add(Factor::default());
        }
        reg.remove(1)?;
        reg.remove(3)?;
        assert_eq!(reg.add(Factor::default()), 3);
        assert_eq!(reg.add(Factor::default()), 1);
        assert_eq!(reg.add(Factor::default()), 4);
        Ok(())
    }

    #[test]
    fn test_remove_missing_fails() {
        let mut reg = FactorRegistry::new();
        reg.add(Factor::default());
        let err = reg.remove(7).unwrap_err();
        assert!(err.to_string().contains("attempted to remove factor 7"));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_snapshot_is_detached() {
        let mut reg = FactorRegistry::new();
        reg.add(Factor::default());
        let mut snap = reg.snapshot();
        snap.clear();
        assert_eq!(reg.len(), 1);
    }
}
