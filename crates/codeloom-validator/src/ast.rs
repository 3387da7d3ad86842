use tree_sitter::Node;

pub(crate) fn text<'s>(node: Node<'_>, src: &'s [u8]) -> &'s str {
    node.utf8_text(src).unwrap_or("")
}

pub(crate) fn line(node: Node<'_>) -> usize {
    node.start_position().row + 1
}

pub(crate) fn named_children<'t>(node: Node<'t>) -> Vec<Node<'t>> {
    let mut cursor = node.walk();
    node.named_children(&mut cursor).collect()
}

pub(crate) fn children<'t>(node: Node<'t>) -> Vec<Node<'t>> {
    let mut cursor = node.walk();
    node.children(&mut cursor).collect()
}

pub(crate) fn field_children<'t>(node: Node<'t>, field: &str) -> Vec<Node<'t>> {
    let mut cursor = node.walk();
    node.children_by_field_name(field, &mut cursor).collect()
}

/// Pre-order traversal of every node below and including `root`.
pub(crate) fn descendants(root: Node<'_>) -> Vec<Node<'_>> {
    let mut out = Vec::new();
    let mut stack = vec![root];
    while let Some(node) = stack.pop() {
        out.push(node);
        let mut kids = children(node);
        kids.reverse();
        stack.extend(kids);
    }
    out
}

/// Contents of a plain string literal; `None` for f-strings, concatenations
/// and anything with interpolation.
pub(crate) fn string_literal(node: Node<'_>, src: &[u8]) -> Option<String> {
    if node.kind() != "string" {
        return None;
    }
    let parts = children(node);
    let start = parts.first().filter(|n| n.kind() == "string_start")?;
    let end = parts.last().filter(|n| n.kind() == "string_end")?;
    if parts.iter().any(|n| n.kind() == "interpolation") {
        return None;
    }
    let prefix = text(*start, src);
    if prefix.contains(['f', 'F']) {
        return None;
    }
    let body = src.get(start.end_byte()..end.start_byte())?;
    std::str::from_utf8(body).ok().map(str::to_string)
}

/// First segment of an import path such as `os.path`.
pub(crate) fn root_module(dotted: &str) -> &str {
    dotted.split('.').next().unwrap_or(dotted).trim()
}
