use proptest::prelude::*;
use rtbroker::container::{ByClass, ByName, ReferenceContainer, Search, SearchMode};
use rtbroker::object::{Object, Reference, ReferenceT};
use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap};

struct Leaf(&'static str);

impl Object for Leaf {
    fn name(&self) -> &str {
        self.0
    }

    fn class_name(&self) -> &'static str {
        "Leaf"
    }
}

#[test]
fn insert_get_delete() {
    let container = ReferenceContainer::new("C");
    for name in ["R1", "R2", "R3"] {
        container.insert(Reference::new(Leaf(name))).unwrap();
    }
    assert_eq!(container.get(0).unwrap().name(), Some("R1"));
    let first = container.get(0).unwrap();
    assert!(container.delete(&first).unwrap());
    assert_eq!(container.size(), 2);
    assert_eq!(container.get(0).unwrap().name(), Some("R2"));
}

#[test]
fn recursive_search_terminates_on_cycle() {
    let a = ReferenceT::new(ReferenceContainer::new("A"));
    let b = ReferenceT::new(ReferenceContainer::new("B"));
    a.insert(b.to_reference()).unwrap();
    b.insert(a.to_reference()).unwrap();
    b.insert(Reference::new(Leaf("x"))).unwrap();

    let visits: RefCell<HashMap<String, usize>> = RefCell::new(HashMap::new());
    let filter = |r: &Reference| {
        if let Some(name) = r.name() {
            *visits.borrow_mut().entry(name.to_string()).or_default() += 1;
        }
        false
    };
    let mut search = Search::all(&filter);
    let found = a.find(&mut search).unwrap();
    assert!(found.is_empty());
    for (name, count) in visits.borrow().iter() {
        assert_eq!(*count, 1, "{} visited {} times", name, count);
    }
    assert_eq!(visits.borrow().len(), 3);

    let by_name = ByName::new("x");
    let mut search = Search::new(&by_name, -1, SearchMode::RECURSIVE);
    let paths: Vec<Vec<String>> = a
        .find_paths(&mut search)
        .unwrap()
        .iter()
        .map(|p| p.iter().map(|r| r.name().unwrap_or("").to_string()).collect())
        .collect();
    assert_eq!(paths, [["B", "x"]]);

    a.purge();
    assert_eq!(a.number_of_references(), 1);
    assert!(b.is_empty());
}

#[test]
fn shared_child_is_found_on_each_branch() {
    let root = ReferenceContainer::new("Root");
    let left = ReferenceT::new(ReferenceContainer::new("Left"));
    let right = ReferenceT::new(ReferenceContainer::new("Right"));
    let shared = Reference::new(Leaf("shared"));
    left.insert(shared.clone()).unwrap();
    right.insert(shared).unwrap();
    root.insert(left.to_reference()).unwrap();
    root.insert(right.to_reference()).unwrap();

    let leaves = ByClass("Leaf");
    let mut search = Search::all(&leaves);
    assert_eq!(root.find(&mut search).unwrap().len(), 2);
    assert_eq!(search.found(), 2);
}

/// Container count, extra edges (back-edges and self-loops included) and
/// the owner of each leaf.
fn graph() -> impl Strategy<Value = (usize, BTreeSet<(usize, usize)>, Vec<usize>)> {
    (2usize..7).prop_flat_map(|n| {
        (
            Just(n),
            prop::collection::btree_set((0..n, 0..n), 0..12),
            prop::collection::vec(0..n, 1..6),
        )
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn search_and_purge_survive_arbitrary_cycles((n, edges, owners) in graph()) {
        let nodes: Vec<ReferenceT<ReferenceContainer>> = (0..n)
            .map(|i| ReferenceT::new(ReferenceContainer::new(&format!("C{}", i))))
            .collect();
        // A chain keeps every container reachable from the root.
        for i in 1..n {
            nodes[i - 1].insert(nodes[i].to_reference()).unwrap();
        }
        for &(from, to) in edges.iter().filter(|&&(from, to)| to != from + 1) {
            nodes[from].insert(nodes[to].to_reference()).unwrap();
        }
        let leaves: Vec<Reference> = owners
            .iter()
            .map(|&owner| {
                let leaf = Reference::new(Leaf("leaf"));
                nodes[owner].insert(leaf.clone()).unwrap();
                leaf
            })
            .collect();

        let root: &ReferenceContainer = &nodes[0];
        let root_ref = nodes[0].to_reference();
        let by_class = ByClass("Leaf");
        let mut search = Search::all(&by_class);
        let paths = root.find_paths(&mut search).unwrap();
        prop_assert_eq!(search.found() as usize, paths.len());

        for (i, path) in paths.iter().enumerate() {
            // Each step is an entry of the container before it.
            let mut level = root;
            for (k, step) in path.iter().enumerate() {
                prop_assert!((0..level.size()).any(|j| level.get(j).map_or(false, |r| r.ptr_eq(step))));
                if k + 1 < path.len() {
                    level = step.as_container().unwrap();
                }
            }
            let containers = &path[..path.len() - 1];
            prop_assert!(!containers.iter().any(|c| c.ptr_eq(&root_ref)));
            for (k, c) in containers.iter().enumerate() {
                prop_assert!(!containers[..k].iter().any(|o| o.ptr_eq(c)));
            }
            let same = |other: &Vec<Reference>| {
                other.len() == path.len() && other.iter().zip(path).all(|(a, b)| a.ptr_eq(b))
            };
            prop_assert!(!paths[..i].iter().any(same));
        }
        for leaf in &leaves {
            prop_assert!(paths.iter().any(|p| p.last().map_or(false, |r| r.ptr_eq(leaf))));
        }

        drop(paths);
        drop(root_ref);
        root.purge();
        for node in &nodes {
            prop_assert_eq!(node.number_of_references(), 1);
        }
        for leaf in &leaves {
            prop_assert_eq!(leaf.number_of_references(), 1);
        }
    }
}
