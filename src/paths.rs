//-------------------------------------------------------------------------

// Paths are dot-separated node names; the empty string addresses the root.
// Positions handed back by next_sub_key() sit on the separating dot (or at
// the end of the string) so callers can resume the walk or take the tail.

pub fn next_sub_key(path: &str, pos: usize) -> (&str, usize) {
    let start = if pos == 0 { 0 } else { pos + 1 };
    match path[start..].find('.') {
        Some(i) => (&path[start..start + i], start + i),
        None => (&path[start..], path.len()),
    }
}

pub fn path_tail(path: &str, pos: usize) -> &str {
    if pos == 0 {
        path
    } else if pos >= path.len() {
        ""
    } else {
        &path[pos + 1..]
    }
}

/// Splits "a.b.c" into ("a.b", "c"); a path with no dot is a child of the
/// root, ("", name).
pub fn split_node_path(path: &str) -> (&str, &str) {
    match path.rfind('.') {
        Some(i) => (&path[..i], &path[i + 1..]),
        None => ("", path),
    }
}

/// Splits "a.b.prop" into ("a.b", "prop").  A property path must name a node
/// before the property, so a dotless path is rejected.
pub fn split_property_path(path: &str) -> Option<(&str, &str)> {
    let i = path.rfind('.')?;
    Some((&path[..i], &path[i + 1..]))
}

//-------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_walk_segments() {
        let path = "a.bb.c";
        let (s, pos) = next_sub_key(path, 0);
        assert_eq!((s, pos), ("a", 1));
        let (s, pos) = next_sub_key(path, pos);
        assert_eq!((s, pos), ("bb", 4));
        let (s, pos) = next_sub_key(path, pos);
        assert_eq!((s, pos), ("c", 6));
        assert_eq!(pos, path.len());
    }

    #[test]
    fn test_single_segment() {
        assert_eq!(next_sub_key("abc", 0), ("abc", 3));
    }

    #[test]
    fn test_tail() {
        let path = "a.bb.c";
        assert_eq!(path_tail(path, 0), "a.bb.c");
        assert_eq!(path_tail(path, 1), "bb.c");
        assert_eq!(path_tail(path, 4), "c");
        assert_eq!(path_tail(path, path.len()), "");
    }

    #[test]
    fn test_split_node_path() {
        assert_eq!(split_node_path("a.b.c"), ("a.b", "c"));
        assert_eq!(split_node_path("a"), ("", "a"));
        assert_eq!(split_node_path(""), ("", ""));
    }

    #[test]
    fn test_split_property_path() {
        assert_eq!(split_property_path("a.b.p"), Some(("a.b", "p")));
        assert_eq!(split_property_path("a.p"), Some(("a", "p")));
        assert_eq!(split_property_path("p"), None);
    }
}

//-------------------------------------------------------------------------
