use std::collections::HashSet;

use once_cell::sync::Lazy;
use tree_sitter::Node;

use codeloom_types::CONTEXT_ACCESSOR;

use crate::ast::{children, field_children, line, named_children, text};

static BUILTINS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "abs", "aiter", "all", "anext", "any", "ascii", "bin", "bool", "breakpoint",
        "bytearray", "bytes", "callable", "chr", "classmethod", "compile", "complex",
        "delattr", "dict", "dir", "divmod", "enumerate", "eval", "exec", "filter", "float",
        "format", "frozenset", "getattr", "globals", "hasattr", "hash", "help", "hex", "id",
        "input", "int", "isinstance", "issubclass", "iter", "len", "list", "locals", "map",
        "max", "memoryview", "min", "next", "object", "oct", "open", "ord", "pow", "print",
        "property", "range", "repr", "reversed", "round", "set", "setattr", "slice",
        "sorted", "staticmethod", "str", "sum", "super", "tuple", "type", "vars", "zip",
        "__import__", "__name__", "__file__", "__doc__", "__builtins__", "__spec__",
        "__debug__", "True", "False", "None", "NotImplemented", "Ellipsis", "exit", "quit",
        "BaseException", "BaseExceptionGroup", "Exception", "ExceptionGroup",
        "ArithmeticError", "AssertionError", "AttributeError", "BlockingIOError",
        "BrokenPipeError", "BufferError", "ChildProcessError", "ConnectionAbortedError",
        "ConnectionError", "ConnectionRefusedError", "ConnectionResetError", "EOFError",
        "EnvironmentError", "FileExistsError", "FileNotFoundError", "FloatingPointError",
        "GeneratorExit", "IOError", "ImportError", "IndentationError", "IndexError",
        "InterruptedError", "IsADirectoryError", "KeyError", "KeyboardInterrupt",
        "LookupError", "MemoryError", "ModuleNotFoundError", "NameError",
        "NotADirectoryError", "NotImplementedError", "OSError", "OverflowError",
        "PermissionError", "ProcessLookupError", "RecursionError", "ReferenceError",
        "RuntimeError", "StopAsyncIteration", "StopIteration", "SyntaxError", "SystemError",
        "SystemExit", "TabError", "TimeoutError", "TypeError", "UnboundLocalError",
        "UnicodeDecodeError", "UnicodeEncodeError", "UnicodeError", "UnicodeTranslateError",
        "ValueError", "ZeroDivisionError", "Warning", "UserWarning", "DeprecationWarning",
        "PendingDeprecationWarning", "RuntimeWarning", "SyntaxWarning", "FutureWarning",
        "ImportWarning", "UnicodeWarning", "BytesWarning", "ResourceWarning",
        "EncodingWarning",
    ]
    .into_iter()
    .collect()
});

const TARGET_CONTAINERS: [&str; 8] = [
    "pattern_list",
    "tuple_pattern",
    "list_pattern",
    "tuple",
    "list",
    "parenthesized_expression",
    "list_splat_pattern",
    "list_splat",
];

const COMPREHENSIONS: [&str; 4] = [
    "list_comprehension",
    "set_comprehension",
    "dictionary_comprehension",
    "generator_expression",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct UnresolvedName {
    pub name: String,
    pub line: usize,
}

struct Deferred<'t> {
    params: Option<Node<'t>>,
    body: Node<'t>,
    enclosing: Vec<HashSet<String>>,
}

/// Resolves every identifier read against Python's scoping rules.
///
/// Module-level statements are checked in order. Function and class bodies
/// run later, so they see every module-level binding plus their own locals
/// regardless of position.
struct Resolver<'t, 's> {
    src: &'s [u8],
    module_bindings: HashSet<String>,
    declared_globals: HashSet<String>,
    wildcard_import: bool,
    scopes: Vec<HashSet<String>>,
    in_function: bool,
    deferred: Vec<Deferred<'t>>,
    unresolved: Vec<UnresolvedName>,
}

pub(crate) fn unresolved_names(root: Node<'_>, src: &[u8]) -> Vec<UnresolvedName> {
    let mut module_bindings = HashSet::new();
    let mut wildcard_import = false;
    collect_bindings(root, src, &mut module_bindings, &mut wildcard_import);

    let mut declared_globals = HashSet::new();
    for node in crate::ast::descendants(root) {
        if node.kind() == "global_statement" {
            for ident in named_children(node) {
                declared_globals.insert(text(ident, src).to_string());
            }
        }
    }

    let mut resolver = Resolver {
        src,
        module_bindings,
        declared_globals,
        wildcard_import,
        scopes: vec![HashSet::new()],
        in_function: false,
        deferred: Vec::new(),
        unresolved: Vec::new(),
    };
    resolver.visit(root);
    while let Some(job) = resolver.deferred.pop() {
        resolver.run_deferred(job);
    }

    let mut seen = HashSet::new();
    resolver
        .unresolved
        .into_iter()
        .filter(|u| seen.insert(u.name.clone()))
        .collect()
}

impl<'t, 's> Resolver<'t, 's> {
    fn bind(&mut self, name: &str) {
        if let Some(scope) = self.scopes.last_mut() {
            scope.insert(name.to_string());
        }
    }

    fn resolves(&self, name: &str) -> bool {
        name == CONTEXT_ACCESSOR
            || BUILTINS.contains(name)
            || self.wildcard_import
            || self.declared_globals.contains(name)
            || self.scopes.iter().any(|s| s.contains(name))
            || (self.in_function && self.module_bindings.contains(name))
    }

    fn check(&mut self, ident: Node<'t>) {
        let name = text(ident, self.src);
        if name.is_empty() || self.resolves(name) {
            return;
        }
        self.unresolved.push(UnresolvedName {
            name: name.to_string(),
            line: line(ident),
        });
    }

    fn visit(&mut self, node: Node<'t>) {
        match node.kind() {
            "identifier" => self.check(node),
            "attribute" => {
                if let Some(object) = node.child_by_field_name("object") {
                    self.visit(object);
                }
            }
            "keyword_argument" => {
                if let Some(value) = node.child_by_field_name("value") {
                    self.visit(value);
                }
            }
            "dotted_name" => {
                if let Some(first) = named_children(node).into_iter().next() {
                    self.visit(first);
                }
            }
            "function_definition" => self.visit_function(node),
            "class_definition" => self.visit_class(node),
            "lambda" => self.visit_lambda(node),
            kind if COMPREHENSIONS.contains(&kind) => self.visit_comprehension(node),
            "assignment" => {
                if let Some(right) = node.child_by_field_name("right") {
                    self.visit(right);
                }
                if let Some(annotation) = node.child_by_field_name("type") {
                    self.visit(annotation);
                }
                if let Some(left) = node.child_by_field_name("left") {
                    self.visit_target(left);
                }
            }
            "augmented_assignment" => {
                if let Some(right) = node.child_by_field_name("right") {
                    self.visit(right);
                }
                if let Some(left) = node.child_by_field_name("left") {
                    if left.kind() == "identifier" {
                        self.check(left);
                        let name = text(left, self.src);
                        self.bind(name);
                    } else {
                        self.visit_target(left);
                    }
                }
            }
            "for_statement" => {
                if let Some(right) = node.child_by_field_name("right") {
                    self.visit(right);
                }
                if let Some(left) = node.child_by_field_name("left") {
                    self.visit_target(left);
                }
                self.prebind_loop(node);
                for field in ["body", "alternative"] {
                    if let Some(part) = node.child_by_field_name(field) {
                        self.visit(part);
                    }
                }
            }
            "while_statement" => {
                self.prebind_loop(node);
                self.visit_children(node);
            }
            "named_expression" => {
                if let Some(value) = node.child_by_field_name("value") {
                    self.visit(value);
                }
                if let Some(name) = node.child_by_field_name("name") {
                    let name = text(name, self.src);
                    self.bind(name);
                }
            }
            "import_statement" | "import_from_statement" => {
                let mut wildcard = false;
                for name in import_bindings(node, self.src, &mut wildcard) {
                    self.bind(&name);
                }
            }
            "future_import_statement" => {}
            "global_statement" | "nonlocal_statement" => {
                for ident in named_children(node) {
                    let name = text(ident, self.src);
                    self.bind(name);
                }
            }
            "as_pattern" => {
                let parts = named_children(node);
                if let Some(value) = parts.first() {
                    self.visit(*value);
                }
                if let Some(alias) = node.child_by_field_name("alias") {
                    for name in alias_names(alias, self.src) {
                        self.bind(&name);
                    }
                }
            }
            "except_clause" => {
                let mut after_as = false;
                for child in children(node) {
                    if child.kind() == "as" {
                        after_as = true;
                        continue;
                    }
                    if !child.is_named() {
                        continue;
                    }
                    if after_as && child.kind() == "identifier" {
                        let name = text(child, self.src);
                        self.bind(name);
                    } else {
                        self.visit(child);
                    }
                    after_as = false;
                }
            }
            "case_pattern" => {
                for ident in crate::ast::descendants(node) {
                    if ident.kind() == "identifier" {
                        let name = text(ident, self.src);
                        self.bind(name);
                    }
                }
            }
            "parameters" | "lambda_parameters" => {}
            _ => self.visit_children(node),
        }
    }

    fn visit_children(&mut self, node: Node<'t>) {
        for child in named_children(node) {
            self.visit(child);
        }
    }

    fn visit_target(&mut self, node: Node<'t>) {
        match node.kind() {
            "identifier" => {
                let name = text(node, self.src);
                self.bind(name);
            }
            kind if TARGET_CONTAINERS.contains(&kind) => {
                for child in named_children(node) {
                    self.visit_target(child);
                }
            }
            _ => self.visit(node),
        }
    }

    /// Module-level loops may read names their own body assigns on a later pass.
    fn prebind_loop(&mut self, node: Node<'t>) {
        if self.in_function {
            return;
        }
        let mut names = HashSet::new();
        let mut wildcard = false;
        for field in ["body", "alternative"] {
            if let Some(part) = node.child_by_field_name(field) {
                collect_bindings(part, self.src, &mut names, &mut wildcard);
            }
        }
        if let Some(scope) = self.scopes.last_mut() {
            scope.extend(names);
        }
    }

    fn visit_function(&mut self, node: Node<'t>) {
        if let Some(name) = node.child_by_field_name("name") {
            let name = text(name, self.src);
            self.bind(name);
        }
        let params = node.child_by_field_name("parameters");
        if let Some(params) = params {
            self.visit_param_reads(params);
        }
        if let Some(returns) = node.child_by_field_name("return_type") {
            self.visit(returns);
        }
        if let Some(body) = node.child_by_field_name("body") {
            self.defer(params, body);
        }
    }

    fn visit_class(&mut self, node: Node<'t>) {
        if let Some(name) = node.child_by_field_name("name") {
            let name = text(name, self.src);
            self.bind(name);
        }
        if let Some(bases) = node.child_by_field_name("superclasses") {
            self.visit(bases);
        }
        if let Some(body) = node.child_by_field_name("body") {
            self.defer(None, body);
        }
    }

    fn defer(&mut self, params: Option<Node<'t>>, body: Node<'t>) {
        let enclosing = if self.in_function {
            self.scopes.clone()
        } else {
            Vec::new()
        };
        self.deferred.push(Deferred {
            params,
            body,
            enclosing,
        });
    }

    fn run_deferred(&mut self, job: Deferred<'t>) {
        let mut local = HashSet::new();
        if let Some(params) = job.params {
            local.extend(param_names(params, self.src));
        }
        let mut wildcard = false;
        collect_bindings(job.body, self.src, &mut local, &mut wildcard);
        self.wildcard_import |= wildcard;

        self.scopes = job.enclosing;
        self.scopes.push(local);
        self.in_function = true;
        self.visit_children(job.body);
    }

    fn visit_lambda(&mut self, node: Node<'t>) {
        let params = node.child_by_field_name("parameters");
        if let Some(params) = params {
            self.visit_param_reads(params);
        }
        let scope = params
            .map(|p| param_names(p, self.src).into_iter().collect())
            .unwrap_or_default();
        self.scopes.push(scope);
        if let Some(body) = node.child_by_field_name("body") {
            self.visit(body);
        }
        self.scopes.pop();
    }

    fn visit_comprehension(&mut self, node: Node<'t>) {
        self.scopes.push(HashSet::new());
        for clause in named_children(node) {
            match clause.kind() {
                "for_in_clause" => {
                    for right in field_children(clause, "right") {
                        self.visit(right);
                    }
                    if let Some(left) = clause.child_by_field_name("left") {
                        self.visit_target(left);
                    }
                }
                "if_clause" => self.visit_children(clause),
                _ => {}
            }
        }
        if let Some(body) = node.child_by_field_name("body") {
            self.visit(body);
        }
        self.scopes.pop();
    }

    fn visit_param_reads(&mut self, params: Node<'t>) {
        for param in named_children(params) {
            match param.kind() {
                "default_parameter" | "typed_default_parameter" | "typed_parameter" => {
                    for field in ["type", "value"] {
                        if let Some(part) = param.child_by_field_name(field) {
                            self.visit(part);
                        }
                    }
                }
                _ => {}
            }
        }
    }
}

fn param_names(params: Node<'_>, src: &[u8]) -> Vec<String> {
    let mut out = Vec::new();
    for param in named_children(params) {
        match param.kind() {
            "identifier" => out.push(text(param, src).to_string()),
            "default_parameter" | "typed_default_parameter" => {
                if let Some(name) = param.child_by_field_name("name") {
                    out.extend(target_names(name, src));
                }
            }
            "typed_parameter" | "list_splat_pattern" | "dictionary_splat_pattern" => {
                if let Some(inner) = named_children(param).into_iter().find(|n| {
                    matches!(
                        n.kind(),
                        "identifier" | "list_splat_pattern" | "dictionary_splat_pattern"
                    )
                }) {
                    if inner.kind() == "identifier" {
                        out.push(text(inner, src).to_string());
                    } else {
                        out.extend(param_names_of_splat(inner, src));
                    }
                }
            }
            "tuple_pattern" => out.extend(target_names(param, src)),
            _ => {}
        }
    }
    out
}

fn param_names_of_splat(node: Node<'_>, src: &[u8]) -> Vec<String> {
    named_children(node)
        .into_iter()
        .filter(|n| n.kind() == "identifier")
        .map(|n| text(n, src).to_string())
        .collect()
}

fn target_names(node: Node<'_>, src: &[u8]) -> Vec<String> {
    match node.kind() {
        "identifier" => vec![text(node, src).to_string()],
        kind if TARGET_CONTAINERS.contains(&kind) => named_children(node)
            .into_iter()
            .flat_map(|child| target_names(child, src))
            .collect(),
        _ => Vec::new(),
    }
}

fn alias_names(alias: Node<'_>, src: &[u8]) -> Vec<String> {
    if alias.kind() == "identifier" {
        return vec![text(alias, src).to_string()];
    }
    let mut names = target_names(alias, src);
    if names.is_empty() {
        names = crate::ast::descendants(alias)
            .into_iter()
            .filter(|n| n.kind() == "identifier")
            .map(|n| text(n, src).to_string())
            .collect();
    }
    if names.is_empty() {
        let raw = text(alias, src).trim();
        if !raw.is_empty() && raw.chars().all(|c| c.is_alphanumeric() || c == '_') {
            names.push(raw.to_string());
        }
    }
    names
}

/// Names an import statement introduces into the current scope.
pub(crate) fn import_bindings(node: Node<'_>, src: &[u8], wildcard: &mut bool) -> Vec<String> {
    let mut out = Vec::new();
    let is_from = node.kind() == "import_from_statement";
    for name in field_children(node, "name") {
        match name.kind() {
            "aliased_import" => {
                if let Some(alias) = name.child_by_field_name("alias") {
                    out.push(text(alias, src).to_string());
                }
            }
            "dotted_name" => {
                let full = text(name, src);
                let bound = if is_from {
                    full.rsplit('.').next().unwrap_or(full)
                } else {
                    crate::ast::root_module(full)
                };
                out.push(bound.trim().to_string());
            }
            _ => {}
        }
    }
    if is_from && named_children(node).iter().any(|n| n.kind() == "wildcard_import") {
        *wildcard = true;
    }
    out
}

/// Every name a block binds, without descending into nested scopes.
fn collect_bindings(node: Node<'_>, src: &[u8], out: &mut HashSet<String>, wildcard: &mut bool) {
    match node.kind() {
        "function_definition" | "class_definition" => {
            if let Some(name) = node.child_by_field_name("name") {
                out.insert(text(name, src).to_string());
            }
            return;
        }
        "lambda" => return,
        kind if COMPREHENSIONS.contains(&kind) => return,
        "assignment" | "augmented_assignment" | "for_statement" => {
            if let Some(left) = node.child_by_field_name("left") {
                out.extend(target_names(left, src));
            }
        }
        "named_expression" => {
            if let Some(name) = node.child_by_field_name("name") {
                out.insert(text(name, src).to_string());
            }
        }
        "import_statement" | "import_from_statement" => {
            out.extend(import_bindings(node, src, wildcard));
            return;
        }
        "global_statement" | "nonlocal_statement" => {
            for ident in named_children(node) {
                out.insert(text(ident, src).to_string());
            }
            return;
        }
        "as_pattern" => {
            if let Some(alias) = node.child_by_field_name("alias") {
                out.extend(alias_names(alias, src));
            }
        }
        "except_clause" => {
            let mut after_as = false;
            for child in children(node) {
                if child.kind() == "as" {
                    after_as = true;
                    continue;
                }
                if after_as && child.kind() == "identifier" {
                    out.insert(text(child, src).to_string());
                }
                if child.is_named() {
                    after_as = false;
                }
            }
        }
        "case_pattern" => {
            for ident in crate::ast::descendants(node) {
                if ident.kind() == "identifier" {
                    out.insert(text(ident, src).to_string());
                }
            }
            return;
        }
        _ => {}
    }
    for child in named_children(node) {
        collect_bindings(child, src, out, wildcard);
    }
}
