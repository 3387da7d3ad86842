//! Static checks run on every generated Python program before it reaches the sandbox.
//!
//! Checks run in a fixed order and all of them report, so one pass surfaces
//! every fixable problem. Only a parse failure stops the pipeline early,
//! since the remaining checks need a clean tree.

mod ast;
mod names;
mod rules;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tree_sitter::{Node, Parser};

use codeloom_types::ContextProfile;

pub use rules::{DENIED_MODULES, DYNAMIC_EVAL};

const MAX_SYNTAX_ISSUES: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Check {
    Syntax,
    Names,
    ContextKeys,
    Imports,
    DynamicEval,
}

impl Check {
    pub const ORDER: [Check; 5] = [
        Check::Syntax,
        Check::Names,
        Check::ContextKeys,
        Check::Imports,
        Check::DynamicEval,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Check::Syntax => "syntax",
            Check::Names => "names",
            Check::ContextKeys => "context_keys",
            Check::Imports => "imports",
            Check::DynamicEval => "dynamic_eval",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub check: Check,
    pub line: usize,
    pub message: String,
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] line {}: {}", self.check.as_str(), self.line, self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<ValidationIssue>,
    pub checks_passed: Vec<String>,
    /// Top-level modules imported by the program.
    pub libraries: Vec<String>,
}

impl ValidationReport {
    pub fn error_messages(&self) -> Vec<String> {
        self.errors.iter().map(ToString::to_string).collect()
    }

    fn from_issues(errors: Vec<ValidationIssue>, ran: &[Check], libraries: Vec<String>) -> Self {
        let checks_passed = ran
            .iter()
            .filter(|check| errors.iter().all(|e| e.check != **check))
            .map(|check| check.as_str().to_string())
            .collect();
        Self {
            valid: errors.is_empty(),
            errors,
            checks_passed,
            libraries,
        }
    }
}

#[derive(Debug, Error)]
pub enum ValidatorError {
    #[error("python grammar could not be loaded: {0}")]
    Grammar(#[from] tree_sitter::LanguageError),
    #[error("python parser produced no tree")]
    ParseAborted,
}

/// Runs every static check against `code`, resolving context keys through `profile`.
pub fn validate(code: &str, profile: &ContextProfile) -> Result<ValidationReport, ValidatorError> {
    if code.trim().is_empty() {
        let issue = ValidationIssue {
            check: Check::Syntax,
            line: 1,
            message: "program is empty".to_string(),
        };
        return Ok(ValidationReport::from_issues(
            vec![issue],
            &[Check::Syntax],
            Vec::new(),
        ));
    }

    let mut parser = Parser::new();
    parser.set_language(&tree_sitter_python::LANGUAGE.into())?;
    let tree = parser
        .parse(code, None)
        .ok_or(ValidatorError::ParseAborted)?;
    let root = tree.root_node();
    let src = code.as_bytes();

    if root.has_error() {
        let issues = syntax_issues(root, src);
        tracing::debug!(issues = issues.len(), "generated program failed to parse");
        return Ok(ValidationReport::from_issues(
            issues,
            &[Check::Syntax],
            Vec::new(),
        ));
    }

    let mut errors = Vec::new();
    for unresolved in names::unresolved_names(root, src) {
        errors.push(ValidationIssue {
            check: Check::Names,
            line: unresolved.line,
            message: format!("name `{}` is not defined before use", unresolved.name),
        });
    }
    let rule_sets = [
        (Check::ContextKeys, rules::context_key_hits(root, src, profile)),
        (Check::Imports, rules::import_hits(root, src)),
        (Check::DynamicEval, rules::dynamic_eval_hits(root, src)),
    ];
    for (check, hits) in rule_sets {
        errors.extend(hits.into_iter().map(|hit| ValidationIssue {
            check,
            line: hit.line,
            message: hit.message,
        }));
    }

    let libraries = rules::imported_libraries(root, src);
    Ok(ValidationReport::from_issues(errors, &Check::ORDER, libraries))
}

fn syntax_issues(root: Node<'_>, src: &[u8]) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();
    for node in ast::descendants(root) {
        if issues.len() >= MAX_SYNTAX_ISSUES {
            break;
        }
        if node.is_missing() {
            issues.push(ValidationIssue {
                check: Check::Syntax,
                line: ast::line(node),
                message: format!("syntax error: missing `{}`", node.kind()),
            });
        } else if node.is_error() {
            let snippet = ast::text(node, src)
                .lines()
                .next()
                .unwrap_or_default()
                .chars()
                .take(40)
                .collect::<String>();
            issues.push(ValidationIssue {
                check: Check::Syntax,
                line: ast::line(node),
                message: format!("syntax error near `{}`", snippet.trim()),
            });
        }
    }
    if issues.is_empty() {
        issues.push(ValidationIssue {
            check: Check::Syntax,
            line: 1,
            message: "program could not be parsed".to_string(),
        });
    }
    issues
}

#[cfg(test)]
mod tests {
    use super::*;
    use codeloom_types::Context;
    use serde_json::json;

    fn profile(value: serde_json::Value) -> ContextProfile {
        ContextProfile::from_context(&Context::from_value(value).expect("context"))
    }

    fn checks(report: &ValidationReport) -> Vec<Check> {
        report.errors.iter().map(|e| e.check).collect()
    }

    const DECLARE: &str =
        "import json\nprint(json.dumps({\"status\": \"success\", \"context_updates\": {\"total\": total}}))\n";

    #[test]
    fn accepts_well_formed_program() {
        let code = format!("total = context['a'] + context['b']\n{DECLARE}");
        let report = validate(&code, &profile(json!({"a": 2, "b": 3}))).expect("validate");
        assert!(report.valid, "{:?}", report.errors);
        assert_eq!(
            report.checks_passed,
            vec!["syntax", "names", "context_keys", "imports", "dynamic_eval"]
        );
        assert_eq!(report.libraries, vec!["json"]);
    }

    #[test]
    fn parse_failure_short_circuits() {
        let report = validate("def broken(:\n    return 1\n", &profile(json!({}))).expect("validate");
        assert!(!report.valid);
        assert!(report.errors.iter().all(|e| e.check == Check::Syntax));
        assert!(report.checks_passed.is_empty());
    }

    #[test]
    fn empty_program_is_rejected() {
        let report = validate("   \n", &profile(json!({}))).expect("validate");
        assert_eq!(checks(&report), vec![Check::Syntax]);
    }

    #[test]
    fn reports_every_failing_check_in_one_pass() {
        let code = "import subprocess\nvalue = context['missing']\nprint(undefined_name)\neval('1')\n";
        let report = validate(code, &profile(json!({"a": 1}))).expect("validate");
        let found = checks(&report);
        assert!(found.contains(&Check::Names));
        assert!(found.contains(&Check::ContextKeys));
        assert!(found.contains(&Check::Imports));
        assert!(found.contains(&Check::DynamicEval));
        assert_eq!(report.checks_passed, vec!["syntax"]);
    }

    #[test]
    fn module_level_reads_must_follow_writes() {
        let report = validate("print(x)\nx = 1\n", &profile(json!({}))).expect("validate");
        assert_eq!(report.errors[0].check, Check::Names);
        assert!(report.errors[0].message.contains("`x`"));
    }

    #[test]
    fn function_bodies_see_later_module_definitions() {
        let code = r#"
import json

def run():
    rows = [normalize(r) for r in context["rows"]]
    return {k: v for k, v in enumerate(rows)}

def normalize(row, *args, scale: float = 1.0, **kwargs):
    total = 0
    for item in row:
        total += item * scale
    with open("/tmp/x", "w") as handle:
        handle.write(str(total))
    try:
        pass
    except ValueError as exc:
        print(exc)
    squared = lambda n: n * n
    return squared(total) if (doubled := total * 2) else doubled

class Summary:
    limit = 3

    def describe(self):
        return Summary.limit + len(helper_names)

helper_names = ["a"]
result = run()
print(json.dumps({"status": "success", "context_updates": {"result": result}}))
"#;
        let report = validate(code, &profile(json!({"rows": [[1, 2]]}))).expect("validate");
        assert!(report.valid, "{:?}", report.errors);
    }

    #[test]
    fn attribute_and_keyword_names_are_not_reads() {
        let code = "import math\nvalue = math.floor(x=context['n'])\nprint(value.real)\n";
        let report = validate(code, &profile(json!({"n": 2.5}))).expect("validate");
        assert!(report.valid, "{:?}", report.errors);
    }

    #[test]
    fn context_writes_make_later_reads_valid() {
        let code = "context['scratch'] = 1\ncontext.update({'other': 2})\nprint(context['scratch'] + context['other'])\nprint(context.get('nope'))\n";
        let report = validate(code, &profile(json!({}))).expect("validate");
        assert!(report.valid, "{:?}", report.errors);
    }

    #[test]
    fn secret_keys_are_readable_through_config_flags() {
        let code = "token = context['api_token']\n";
        let report = validate(code, &profile(json!({"api_token": "t0k"}))).expect("validate");
        assert!(report.valid, "{:?}", report.errors);
    }

    #[test]
    fn fstring_subscripts_are_not_checked() {
        let code = "name = 'x'\nvalue = context[f'{name}_1']\n";
        let report = validate(code, &profile(json!({}))).expect("validate");
        assert!(report.valid, "{:?}", report.errors);
    }

    #[test]
    fn denied_os_calls_are_caught_through_aliases() {
        let code = "import os as o\nimport shutil\no.system('ls')\nshutil.rmtree('/tmp/x')\nprint(o.path.join('a', 'b'))\n";
        let report = validate(code, &profile(json!({}))).expect("validate");
        let imports = report
            .errors
            .iter()
            .filter(|e| e.check == Check::Imports)
            .count();
        assert_eq!(imports, 2, "{:?}", report.errors);
    }

    #[test]
    fn from_imports_of_denied_members_are_caught() {
        let code = "from os import popen\nfrom importlib import import_module\n";
        let report = validate(code, &profile(json!({}))).expect("validate");
        assert_eq!(checks(&report), vec![Check::Imports, Check::Imports]);
    }

    #[test]
    fn libraries_list_top_level_modules() {
        let code = "import os.path\nimport numpy as np\nfrom pandas.io import json as pj\nfrom . import sibling\n";
        let report = validate(code, &profile(json!({}))).expect("validate");
        assert_eq!(report.libraries, vec!["numpy", "os", "pandas"]);
    }

    #[test]
    fn dynamic_eval_builtins_are_caught_when_aliased() {
        let report = validate("f = eval\nf('1+1')\n", &profile(json!({}))).expect("validate");
        assert!(!report.valid);
        assert_eq!(checks(&report), vec![Check::DynamicEval]);
        assert!(report.errors[0].message.contains("`eval`"));

        let passed = validate("handlers = [exec, print]\n", &profile(json!({}))).expect("validate");
        assert_eq!(checks(&passed), vec![Check::DynamicEval]);
    }

    #[test]
    fn dynamic_eval_names_as_members_or_keywords_are_fine() {
        let code = "import re\npattern = re.compile('a+')\nprint(dict(eval=1), pattern)\nfrom re import compile as build\n";
        let report = validate(code, &profile(json!({}))).expect("validate");
        assert!(report.valid, "{:?}", report.errors);
    }

    #[test]
    fn denied_os_members_are_caught_when_used_as_values() {
        let code = "import os\nrun = os.system\nrun('id')\n";
        let report = validate(code, &profile(json!({}))).expect("validate");
        assert_eq!(checks(&report), vec![Check::Imports]);
        assert!(report.errors[0].message.contains("os.system"));

        let rebound = "import shutil\nsh = shutil\nsh.rmtree('/tmp/x')\n";
        let report = validate(rebound, &profile(json!({}))).expect("validate");
        assert_eq!(checks(&report), vec![Check::Imports]);
        assert!(report.errors[0].message.contains("shutil.rmtree"));
    }

    #[test]
    fn getattr_on_denied_modules_is_caught() {
        let literal = "import os\ngetattr(os, 'system')('id')\n";
        let report = validate(literal, &profile(json!({}))).expect("validate");
        assert_eq!(checks(&report), vec![Check::Imports]);
        assert!(report.errors[0].message.contains("os.system"));

        let computed = "import os as o\nname = 'sys' + 'tem'\ngetattr(o, name)('id')\n";
        let report = validate(computed, &profile(json!({}))).expect("validate");
        assert_eq!(checks(&report), vec![Check::Imports]);

        let harmless = "import os\nsep = getattr(os, 'sep')\nprint(sep)\n";
        let report = validate(harmless, &profile(json!({}))).expect("validate");
        assert!(report.valid, "{:?}", report.errors);
    }

    #[test]
    fn builtins_access_is_flagged() {
        let report = validate("f = __builtins__\n", &profile(json!({}))).expect("validate");
        assert_eq!(checks(&report), vec![Check::DynamicEval]);
    }
}
