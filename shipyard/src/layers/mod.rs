//! Layer chain resolution.
//!
//! Turns an image name into the ordered list of layers whose directories
//! form the overlay lowerdir, closest ancestor first:
//!
//! ```text
//! app ──base_image──► runtime ──base_image──► base ──base_image──► root
//!
//! resolve("app") = [app, runtime, base, root]
//! ```
//!
//! Resolution is a pure function over persisted crate metadata. A missing
//! ancestor fails with [`ShipyardError::LayerNotFound`] naming that ancestor;
//! a chain that revisits a layer or grows past
//! [`MAX_LAYER_DEPTH`](shipyard_shared::constants::layers::MAX_LAYER_DEPTH)
//! fails with [`ShipyardError::LayerCycle`].

use std::collections::HashMap;

use shipyard_shared::constants::layers::{MAX_LAYER_DEPTH, ROOT_LAYER};
use shipyard_shared::errors::{ShipyardError, ShipyardResult};

/// Source of parent links between layers.
pub trait LayerLookup {
    /// Base image of `name`, or `None` if no such layer is persisted.
    fn parent_of(&self, name: &str) -> ShipyardResult<Option<String>>;
}

impl LayerLookup for HashMap<String, String> {
    fn parent_of(&self, name: &str) -> ShipyardResult<Option<String>> {
        Ok(self.get(name).cloned())
    }
}

impl<T: LayerLookup + ?Sized> LayerLookup for &T {
    fn parent_of(&self, name: &str) -> ShipyardResult<Option<String>> {
        (**self).parent_of(name)
    }
}

/// Resolve `name` into its layer chain, closest first, ending at the root layer.
pub fn resolve<L: LayerLookup + ?Sized>(lookup: &L, name: &str) -> ShipyardResult<Vec<String>> {
    let mut chain: Vec<String> = Vec::new();
    let mut current = name.to_string();

    loop {
        if current == ROOT_LAYER {
            chain.push(current);
            break;
        }

        if chain.len() >= MAX_LAYER_DEPTH || chain.contains(&current) {
            tracing::warn!(image = %name, layer = %current, "Layer chain does not terminate");
            return Err(ShipyardError::LayerCycle(name.to_string()));
        }

        let parent = lookup
            .parent_of(&current)?
            .ok_or_else(|| ShipyardError::LayerNotFound(current.clone()))?;

        chain.push(current);
        current = parent;
    }

    tracing::debug!(image = %name, layers = ?chain, "Resolved layer chain");
    Ok(chain)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn lookup(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_root_resolves_to_itself() {
        let layers = lookup(&[]);
        assert_eq!(resolve(&layers, "root").unwrap(), vec!["root"]);
    }

    #[test]
    fn test_chain_is_closest_first() {
        let layers = lookup(&[("A", "B"), ("B", "C"), ("C", "root")]);
        assert_eq!(resolve(&layers, "A").unwrap(), vec!["A", "B", "C", "root"]);
    }

    #[test]
    fn test_resolution_is_idempotent() {
        let layers = lookup(&[("A", "B"), ("B", "root")]);
        let first = resolve(&layers, "A").unwrap();
        let second = resolve(&layers, "A").unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_missing_ancestor_named_in_error() {
        let layers = lookup(&[("A", "B"), ("B", "gone")]);
        match resolve(&layers, "A") {
            Err(ShipyardError::LayerNotFound(name)) => assert_eq!(name, "gone"),
            other => panic!("expected LayerNotFound(gone), got {:?}", other),
        }
    }

    #[test]
    fn test_missing_image_itself() {
        let layers = lookup(&[]);
        assert!(matches!(
            resolve(&layers, "nope"),
            Err(ShipyardError::LayerNotFound(name)) if name == "nope"
        ));
    }

    #[test]
    fn test_cycle_fails_closed() {
        let layers = lookup(&[("A", "B"), ("B", "A")]);
        assert!(matches!(
            resolve(&layers, "A"),
            Err(ShipyardError::LayerCycle(name)) if name == "A"
        ));
    }

    #[test]
    fn test_self_parent_fails_closed() {
        let layers = lookup(&[("A", "A")]);
        assert!(matches!(resolve(&layers, "A"), Err(ShipyardError::LayerCycle(_))));
    }

    proptest! {
        #[test]
        fn prop_linear_chain_resolves_in_order(len in 1usize..40) {
            let names: Vec<String> = (0..len).map(|i| format!("layer{}", i)).collect();
            let mut layers = HashMap::new();
            for i in 0..len {
                let parent = names.get(i + 1).cloned().unwrap_or_else(|| ROOT_LAYER.to_string());
                layers.insert(names[i].clone(), parent);
            }

            let chain = resolve(&layers, &names[0]).unwrap();
            prop_assert_eq!(chain.len(), len + 1);
            prop_assert_eq!(&chain[..len], &names[..]);
            prop_assert_eq!(chain.last().map(String::as_str), Some(ROOT_LAYER));
        }
    }
}
