//! Deriving object hierarchy from the flat list of paths exported on the bus.

use std::collections::HashSet;

/// Returns the distinct path segments directly below `base`.
///
/// `paths` is the flat list of every object path currently exported by a service. The hierarchy
/// is recomputed on every call; nothing is cached. A `base` of `/` denotes the root.
///
/// The returned segments keep the order in which they first appear in `paths`.
pub fn children_of<'a, I>(base: &str, paths: I) -> Vec<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let base = if base == "/" { "" } else { base };

    let mut seen = HashSet::new();
    let mut children = Vec::new();
    for path in paths {
        let Some(rest) = path.strip_prefix(base) else {
            continue;
        };
        // `rest` is the part after the base, which must start on a segment boundary.
        let Some(rest) = rest.strip_prefix('/') else {
            continue;
        };
        let segment = rest.split('/').next().unwrap_or_default();
        if segment.is_empty() {
            continue;
        }
        if seen.insert(segment) {
            children.push(segment.to_string());
        }
    }
    children
}

#[cfg(test)]
mod tests {
    use super::*;

    const NODES: [&str; 5] = ["/foo", "/foo/a", "/foo/b/1", "/foo/c/1", "/foo/c/2"];

    #[test]
    fn root() {
        assert_eq!(children_of("/", NODES), ["foo"]);
    }

    #[test]
    fn nested() {
        assert_eq!(children_of("/foo", NODES), ["a", "b", "c"]);
        assert_eq!(children_of("/foo/c", NODES), ["1", "2"]);
    }

    #[test]
    fn no_prefix_match() {
        assert!(children_of("/bar", NODES).is_empty());
        assert!(children_of("/foo/a", NODES).is_empty());
    }

    #[test]
    fn sibling_with_shared_prefix_is_not_a_child() {
        let nodes = ["/org/bluez/hci0/dev_AA", "/org/bluez/hci01/dev_BB"];
        assert_eq!(children_of("/org/bluez/hci0", nodes), ["dev_AA"]);
    }

    #[test]
    fn bluez_layout() {
        let nodes = [
            "/org/bluez",
            "/org/bluez/hci0",
            "/org/bluez/hci0/dev_11_11_11_11_11_11",
            "/org/bluez/hci0/dev_11_11_11_11_11_11/service000a",
            "/org/bluez/hci0/dev_11_11_11_11_11_11/service000a/char000b",
            "/org/bluez/hci1",
        ];
        assert_eq!(children_of("/org/bluez", nodes), ["hci0", "hci1"]);
        assert_eq!(
            children_of("/org/bluez/hci0/dev_11_11_11_11_11_11", nodes),
            ["service000a"]
        );
    }
}
