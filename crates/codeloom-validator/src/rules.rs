use std::collections::{BTreeSet, HashMap, HashSet};

use tree_sitter::Node;

use codeloom_types::{ContextProfile, CONTEXT_ACCESSOR};

use crate::ast::{descendants, field_children, line, named_children, root_module, string_literal, text};

/// Modules generated code may not import at all.
pub const DENIED_MODULES: [&str; 8] = [
    "subprocess",
    "multiprocessing",
    "ctypes",
    "pty",
    "signal",
    "resource",
    "importlib",
    "builtins",
];

/// Builtins that evaluate or expose code dynamically.
pub const DYNAMIC_EVAL: [&str; 7] = [
    "eval",
    "exec",
    "compile",
    "__import__",
    "globals",
    "locals",
    "breakpoint",
];

fn is_denied_member(module: &str, member: &str) -> bool {
    match module {
        "os" => {
            matches!(
                member,
                "system" | "popen" | "fork" | "forkpty" | "kill" | "killpg" | "_exit"
            ) || member.starts_with("exec")
                || member.starts_with("spawn")
        }
        "shutil" => member == "rmtree",
        _ => false,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RuleHit {
    pub line: usize,
    pub message: String,
}

struct KeyUse {
    key: String,
    line: usize,
    write: bool,
}

/// Literal `context[...]` reads must name a known key or one the program writes.
pub(crate) fn context_key_hits(root: Node<'_>, src: &[u8], profile: &ContextProfile) -> Vec<RuleHit> {
    let uses = context_key_uses(root, src);
    let written = uses
        .iter()
        .filter(|u| u.write)
        .map(|u| u.key.clone())
        .collect::<HashSet<_>>();
    let mut reported = HashSet::new();
    let mut hits = Vec::new();
    for usage in uses.iter().filter(|u| !u.write) {
        if profile.knows_key(&usage.key) || written.contains(&usage.key) {
            continue;
        }
        if !reported.insert(usage.key.clone()) {
            continue;
        }
        let mut available = profile
            .schema
            .keys()
            .chain(profile.config.iter().map(|(k, _)| k))
            .map(String::as_str)
            .collect::<Vec<_>>();
        available.sort_unstable();
        hits.push(RuleHit {
            line: usage.line,
            message: format!(
                "context key `{}` does not exist (available keys: {})",
                usage.key,
                if available.is_empty() {
                    "none".to_string()
                } else {
                    available.join(", ")
                }
            ),
        });
    }
    hits
}

fn is_context(node: Node<'_>, src: &[u8]) -> bool {
    node.kind() == "identifier" && text(node, src) == CONTEXT_ACCESSOR
}

fn context_key_uses(root: Node<'_>, src: &[u8]) -> Vec<KeyUse> {
    let mut uses = Vec::new();
    for node in descendants(root) {
        match node.kind() {
            "subscript" => {
                let Some(value) = node.child_by_field_name("value") else {
                    continue;
                };
                if !is_context(value, src) {
                    continue;
                }
                let indices = field_children(node, "subscript");
                let [index] = indices.as_slice() else {
                    continue;
                };
                if let Some(key) = string_literal(*index, src) {
                    uses.push(KeyUse {
                        key,
                        line: line(node),
                        write: is_assignment_target(node),
                    });
                }
            }
            "call" => {
                let Some(function) = node.child_by_field_name("function") else {
                    continue;
                };
                if function.kind() != "attribute" {
                    continue;
                }
                let (Some(object), Some(method)) = (
                    function.child_by_field_name("object"),
                    function.child_by_field_name("attribute"),
                ) else {
                    continue;
                };
                if !is_context(object, src) {
                    continue;
                }
                let Some(args) = node.child_by_field_name("arguments") else {
                    continue;
                };
                match text(method, src) {
                    "setdefault" => {
                        if let Some(key) = named_children(args)
                            .first()
                            .and_then(|first| string_literal(*first, src))
                        {
                            uses.push(KeyUse {
                                key,
                                line: line(node),
                                write: true,
                            });
                        }
                    }
                    "update" => {
                        for arg in named_children(args) {
                            for key in update_keys(arg, src) {
                                uses.push(KeyUse {
                                    key,
                                    line: line(node),
                                    write: true,
                                });
                            }
                        }
                    }
                    _ => {}
                }
            }
            _ => {}
        }
    }
    uses
}

fn update_keys(arg: Node<'_>, src: &[u8]) -> Vec<String> {
    match arg.kind() {
        "keyword_argument" => arg
            .child_by_field_name("name")
            .map(|n| vec![text(n, src).to_string()])
            .unwrap_or_default(),
        "dictionary" => named_children(arg)
            .into_iter()
            .filter(|pair| pair.kind() == "pair")
            .filter_map(|pair| pair.child_by_field_name("key"))
            .filter_map(|key| string_literal(key, src))
            .collect(),
        _ => Vec::new(),
    }
}

/// True when `node` sits on the left side of a plain assignment or for-loop target.
fn is_assignment_target(node: Node<'_>) -> bool {
    let mut current = node;
    while let Some(parent) = current.parent() {
        match parent.kind() {
            "pattern_list" | "tuple_pattern" | "list_pattern" | "tuple" | "list"
            | "parenthesized_expression" | "list_splat_pattern" => current = parent,
            "assignment" | "for_statement" | "for_in_clause" => {
                return parent
                    .child_by_field_name("left")
                    .is_some_and(|left| left.id() == current.id());
            }
            _ => return false,
        }
    }
    false
}

/// Denied modules, denied `os`/`shutil` members and their aliases.
pub(crate) fn import_hits(root: Node<'_>, src: &[u8]) -> Vec<RuleHit> {
    let mut hits = Vec::new();
    let mut aliases: HashMap<String, String> = HashMap::new();

    for node in descendants(root) {
        match node.kind() {
            "import_statement" => {
                for name in field_children(node, "name") {
                    let (module, bound) = match name.kind() {
                        "aliased_import" => {
                            let module = name
                                .child_by_field_name("name")
                                .map(|n| text(n, src))
                                .unwrap_or_default();
                            let alias = name
                                .child_by_field_name("alias")
                                .map(|n| text(n, src).to_string())
                                .unwrap_or_else(|| root_module(module).to_string());
                            (module, alias)
                        }
                        _ => {
                            let module = text(name, src);
                            (module, root_module(module).to_string())
                        }
                    };
                    let root_name = root_module(module);
                    if DENIED_MODULES.contains(&root_name) {
                        hits.push(RuleHit {
                            line: line(node),
                            message: format!("import of `{module}` is not allowed in sandboxed code"),
                        });
                    }
                    let target = if name.kind() == "aliased_import" {
                        module.to_string()
                    } else {
                        root_name.to_string()
                    };
                    aliases.insert(bound, target);
                }
            }
            "assignment" => {
                // `run = os` keeps `run` pointing at the module.
                let (Some(left), Some(right)) = (
                    node.child_by_field_name("left"),
                    node.child_by_field_name("right"),
                ) else {
                    continue;
                };
                if left.kind() != "identifier" || right.kind() != "identifier" {
                    continue;
                }
                if let Some(module) = aliases.get(text(right, src)).cloned() {
                    aliases.insert(text(left, src).to_string(), module);
                }
            }
            "import_from_statement" => {
                let module = node
                    .child_by_field_name("module_name")
                    .map(|n| text(n, src))
                    .unwrap_or_default();
                let root_name = root_module(module);
                if DENIED_MODULES.contains(&root_name) {
                    hits.push(RuleHit {
                        line: line(node),
                        message: format!("import from `{module}` is not allowed in sandboxed code"),
                    });
                    continue;
                }
                if named_children(node).iter().any(|n| n.kind() == "wildcard_import")
                    && matches!(module, "os" | "shutil")
                {
                    hits.push(RuleHit {
                        line: line(node),
                        message: format!("wildcard import from `{module}` is not allowed"),
                    });
                }
                for name in field_children(node, "name") {
                    let member = match name.kind() {
                        "aliased_import" => name
                            .child_by_field_name("name")
                            .map(|n| text(n, src))
                            .unwrap_or_default(),
                        _ => text(name, src),
                    };
                    if is_denied_member(module, member) {
                        hits.push(RuleHit {
                            line: line(node),
                            message: format!("`{module}.{member}` is not allowed in sandboxed code"),
                        });
                    }
                }
            }
            _ => {}
        }
    }

    let resolve = |name: &str| -> String {
        aliases
            .get(name)
            .cloned()
            .unwrap_or_else(|| name.to_string())
    };

    for node in descendants(root) {
        match node.kind() {
            // Any use of a denied member, called or not.
            "attribute" => {
                let (Some(object), Some(member)) = (
                    node.child_by_field_name("object"),
                    node.child_by_field_name("attribute"),
                ) else {
                    continue;
                };
                let module = resolve(text(object, src));
                let member = text(member, src);
                if is_denied_member(&module, member) {
                    hits.push(RuleHit {
                        line: line(node),
                        message: format!("`{module}.{member}` is not allowed in sandboxed code"),
                    });
                }
            }
            "call" => {
                if let Some(hit) = getattr_hit(node, src, &resolve) {
                    hits.push(hit);
                }
            }
            _ => {}
        }
    }
    hits
}

/// `getattr(os, "system")`, or a computed member name on `os`/`shutil`.
fn getattr_hit(node: Node<'_>, src: &[u8], resolve: &dyn Fn(&str) -> String) -> Option<RuleHit> {
    let function = node.child_by_field_name("function")?;
    if function.kind() != "identifier" || text(function, src) != "getattr" {
        return None;
    }
    let args = named_children(node.child_by_field_name("arguments")?);
    let [object, member, ..] = args.as_slice() else {
        return None;
    };
    if object.kind() != "identifier" {
        return None;
    }
    let module = resolve(text(*object, src));
    if !matches!(module.as_str(), "os" | "shutil") {
        return None;
    }
    let message = match string_literal(*member, src) {
        Some(member) if is_denied_member(&module, &member) => {
            format!("`{module}.{member}` is not allowed in sandboxed code")
        }
        Some(_) => return None,
        None => format!("computed attribute lookup on `{module}` is not allowed in sandboxed code"),
    };
    Some(RuleHit {
        line: line(node),
        message,
    })
}

/// Any reference to a dynamic-evaluation builtin, called or not.
pub(crate) fn dynamic_eval_hits(root: Node<'_>, src: &[u8]) -> Vec<RuleHit> {
    let mut hits = Vec::new();
    for node in descendants(root) {
        if node.kind() != "identifier" {
            continue;
        }
        let name = text(node, src);
        if name == "__builtins__" {
            hits.push(RuleHit {
                line: line(node),
                message: "access to `__builtins__` is not allowed".to_string(),
            });
            continue;
        }
        if !DYNAMIC_EVAL.contains(&name) || !is_name_reference(node) {
            continue;
        }
        let called = node
            .parent()
            .filter(|parent| parent.kind() == "call")
            .and_then(|parent| parent.child_by_field_name("function"))
            .is_some_and(|function| function.id() == node.id());
        let message = if called {
            format!("dynamic evaluation via `{name}()` is not allowed")
        } else {
            format!("reference to `{name}` is not allowed (dynamic evaluation)")
        };
        hits.push(RuleHit {
            line: line(node),
            message,
        });
    }
    hits
}

/// False for identifiers that only label something: attribute members,
/// keyword argument names, definition names and import paths.
fn is_name_reference(node: Node<'_>) -> bool {
    let Some(parent) = node.parent() else {
        return true;
    };
    let is_field = |field: &str| {
        parent
            .child_by_field_name(field)
            .is_some_and(|child| child.id() == node.id())
    };
    match parent.kind() {
        "attribute" => !is_field("attribute"),
        "keyword_argument" => !is_field("name"),
        "function_definition" | "class_definition" => !is_field("name"),
        "dotted_name" | "aliased_import" => false,
        _ => true,
    }
}

/// Top-level modules the program imports, sorted and deduplicated.
pub(crate) fn imported_libraries(root: Node<'_>, src: &[u8]) -> Vec<String> {
    let mut libraries = BTreeSet::new();
    for node in descendants(root) {
        match node.kind() {
            "import_statement" => {
                for name in field_children(node, "name") {
                    let dotted = if name.kind() == "aliased_import" {
                        name.child_by_field_name("name").map(|n| text(n, src))
                    } else {
                        Some(text(name, src))
                    };
                    if let Some(dotted) = dotted.filter(|d| !d.is_empty()) {
                        libraries.insert(root_module(dotted).to_string());
                    }
                }
            }
            "import_from_statement" => {
                if let Some(module) = node.child_by_field_name("module_name") {
                    if module.kind() == "dotted_name" {
                        libraries.insert(root_module(text(module, src)).to_string());
                    }
                }
            }
            _ => {}
        }
    }
    libraries.into_iter().collect()
}
