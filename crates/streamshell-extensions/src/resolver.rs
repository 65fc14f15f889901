//! Dependency ordering for manifests.
//!
//! Depth-first traversal over the declared dependency lists. Nodes are
//! visited in discovery order so independent extensions keep a stable,
//! first-seen-first-loaded ordering across reloads.

use std::collections::{HashMap, HashSet};

use crate::error::ExtensionError;
use crate::manifest::ExtensionManifest;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

struct Traversal<'a> {
    by_id: HashMap<&'a str, &'a ExtensionManifest>,
    live: &'a HashSet<String>,
    marks: HashMap<&'a str, Mark>,
    path: Vec<&'a str>,
    order: Vec<&'a ExtensionManifest>,
}

impl<'a> Traversal<'a> {
    fn new(
        manifests: &'a [ExtensionManifest],
        live: &'a HashSet<String>,
    ) -> Result<Self, ExtensionError> {
        let mut by_id = HashMap::with_capacity(manifests.len());
        for m in manifests {
            if by_id.insert(m.identifier.as_str(), m).is_some() {
                return Err(ExtensionError::MalformedManifest(format!(
                    "identifier '{}' declared by more than one bundle",
                    m.identifier
                )));
            }
        }
        Ok(Self {
            by_id,
            live,
            marks: HashMap::new(),
            path: Vec::new(),
            order: Vec::with_capacity(manifests.len()),
        })
    }

    fn visit(&mut self, manifest: &'a ExtensionManifest) -> Result<(), ExtensionError> {
        let id = manifest.identifier.as_str();
        match self.marks.get(id) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::Visiting) => {
                let start = self.path.iter().position(|p| *p == id).unwrap_or(0);
                let mut cycle: Vec<String> =
                    self.path[start..].iter().map(|s| s.to_string()).collect();
                cycle.push(id.to_string());
                return Err(ExtensionError::CyclicDependency(cycle));
            }
            None => {}
        }

        self.marks.insert(id, Mark::Visiting);
        self.path.push(id);

        for dep in &manifest.dependencies {
            if self.live.contains(dep) {
                continue;
            }
            match self.by_id.get(dep.as_str()).copied() {
                Some(dep_manifest) => self.visit(dep_manifest)?,
                None => {
                    return Err(ExtensionError::MissingDependency {
                        extension: id.to_string(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        self.path.pop();
        self.marks.insert(id, Mark::Done);
        self.order.push(manifest);
        Ok(())
    }
}

/// Order every manifest after all of its dependencies.
///
/// `manifests` is taken in discovery order. Dependencies absent from the
/// set but present in `live` (already loaded) are satisfied.
pub fn resolve<'a>(
    manifests: &'a [ExtensionManifest],
    live: &'a HashSet<String>,
) -> Result<Vec<&'a ExtensionManifest>, ExtensionError> {
    let mut traversal = Traversal::new(manifests, live)?;
    for manifest in manifests {
        traversal.visit(manifest)?;
    }
    Ok(traversal.order)
}

/// Order the dependency closure of `root`, ending with `root` itself.
///
/// Dependencies already in `live` are not revisited and do not appear in the
/// returned sequence.
pub fn resolve_closure<'a>(
    root: &str,
    manifests: &'a [ExtensionManifest],
    live: &'a HashSet<String>,
) -> Result<Vec<&'a ExtensionManifest>, ExtensionError> {
    let mut traversal = Traversal::new(manifests, live)?;
    let root_manifest = traversal
        .by_id
        .get(root)
        .copied()
        .ok_or_else(|| ExtensionError::NotDiscovered(root.to_string()))?;
    traversal.visit(root_manifest)?;
    Ok(traversal.order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn manifest(id: &str, deps: &[&str]) -> ExtensionManifest {
        ExtensionManifest {
            identifier: id.into(),
            name: id.into(),
            version: "1.0.0".into(),
            author: "test".into(),
            description: None,
            min_host_version: None,
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
            permissions: BTreeSet::new(),
            main: None,
            subscriptions: vec![],
            http_hosts: vec![],
            license: None,
            homepage: None,
        }
    }

    fn ids(order: &[&ExtensionManifest]) -> Vec<String> {
        order.iter().map(|m| m.identifier.clone()).collect()
    }

    fn position(order: &[String], id: &str) -> usize {
        order.iter().position(|x| x == id).unwrap()
    }

    #[test]
    fn test_resolve_no_dependencies_keeps_discovery_order() {
        let set = vec![manifest("cc", &[]), manifest("aa", &[]), manifest("bb", &[])];
        let live = HashSet::new();
        let order = ids(&resolve(&set, &live).unwrap());
        assert_eq!(order, vec!["cc", "aa", "bb"]);
    }

    #[test]
    fn test_resolve_dependencies_come_first() {
        let set = vec![
            manifest("app", &["ui-kit", "net"]),
            manifest("net", &["core"]),
            manifest("ui-kit", &["core"]),
            manifest("core", &[]),
            manifest("solo", &[]),
        ];
        let live = HashSet::new();
        let order = ids(&resolve(&set, &live).unwrap());
        assert_eq!(order.len(), 5);
        for m in &set {
            for dep in &m.dependencies {
                assert!(position(&order, dep) < position(&order, &m.identifier));
            }
        }
        // Deterministic across calls
        assert_eq!(order, ids(&resolve(&set, &live).unwrap()));
    }

    #[test]
    fn test_resolve_detects_cycle() {
        let set = vec![
            manifest("aa", &["bb"]),
            manifest("bb", &["cc"]),
            manifest("cc", &["aa"]),
            manifest("dd", &[]),
        ];
        let live = HashSet::new();
        match resolve(&set, &live).unwrap_err() {
            ExtensionError::CyclicDependency(path) => {
                assert_eq!(path, vec!["aa", "bb", "cc", "aa"]);
            }
            other => panic!("expected CyclicDependency, got {other:?}"),
        }
    }

    #[test]
    fn test_resolve_detects_two_node_cycle_deep_in_graph() {
        let set = vec![
            manifest("root", &["mid"]),
            manifest("mid", &["xx"]),
            manifest("xx", &["yy"]),
            manifest("yy", &["xx"]),
        ];
        let live = HashSet::new();
        match resolve(&set, &live).unwrap_err() {
            ExtensionError::CyclicDependency(path) => {
                assert!(path.contains(&"xx".to_string()));
                assert!(path.contains(&"yy".to_string()));
                assert!(!path.contains(&"root".to_string()));
            }
            other => panic!("expected CyclicDependency, got {other:?}"),
        }
    }

    #[test]
    fn test_resolve_missing_dependency() {
        let set = vec![manifest("app", &["ghost"])];
        let live = HashSet::new();
        match resolve(&set, &live).unwrap_err() {
            ExtensionError::MissingDependency {
                extension,
                dependency,
            } => {
                assert_eq!(extension, "app");
                assert_eq!(dependency, "ghost");
            }
            other => panic!("expected MissingDependency, got {other:?}"),
        }
    }

    #[test]
    fn test_resolve_live_dependency_satisfies_edge() {
        let set = vec![manifest("app", &["core"])];
        let live: HashSet<String> = ["core".to_string()].into_iter().collect();
        let order = ids(&resolve(&set, &live).unwrap());
        assert_eq!(order, vec!["app"]);
    }

    #[test]
    fn test_resolve_duplicate_identifier() {
        let set = vec![manifest("aa", &[]), manifest("aa", &[])];
        let live = HashSet::new();
        assert!(matches!(
            resolve(&set, &live),
            Err(ExtensionError::MalformedManifest(_))
        ));
    }

    #[test]
    fn test_resolve_closure_only_includes_needed() {
        let set = vec![
            manifest("other", &[]),
            manifest("app", &["net"]),
            manifest("net", &["core"]),
            manifest("core", &[]),
        ];
        let live: HashSet<String> = ["core".to_string()].into_iter().collect();
        let order = ids(&resolve_closure("app", &set, &live).unwrap());
        assert_eq!(order, vec!["net", "app"]);
    }

    #[test]
    fn test_resolve_closure_unknown_root() {
        let set = vec![manifest("app", &[])];
        let live = HashSet::new();
        assert!(matches!(
            resolve_closure("nope", &set, &live),
            Err(ExtensionError::NotDiscovered(_))
        ));
    }
}
