//! tree-sitter grammar wiring and the declarative per-family classification
//! tables, feature-gated behind `treesitter` exactly like the teacher's
//! `ast.rs`.

use regex::Regex;
use std::sync::OnceLock;
use tree_sitter::{Language, Node, Parser};

use super::{DraftDef, DraftDynamicAccessSite, DraftExportEntry, DraftImport, DraftLocalBind, DraftRef, DraftScope, LanguageFamily, ParseOutcome};
use crate::structural::facts::{Certainty, ReasonCode, RefRole};

fn language_for(family: LanguageFamily) -> Language {
    match family {
        LanguageFamily::Rust => tree_sitter_rust::LANGUAGE.into(),
        LanguageFamily::TypeScript => tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into(),
        LanguageFamily::JavaScript => tree_sitter_javascript::LANGUAGE.into(),
        LanguageFamily::Python => tree_sitter_python::LANGUAGE.into(),
    }
}

/// Version-pinned def-node classification. A grammar upgrade that renames
/// these node kinds is an explicit breaking change to this table, not a
/// silent behavior shift.
fn classify_def_kind(kind: &str) -> Option<&'static str> {
    match kind {
        "function_item" => Some("function"),
        "struct_item" => Some("struct"),
        "enum_item" => Some("enum"),
        "trait_item" => Some("trait"),
        "impl_item" => Some("impl"),
        "type_item" => Some("type_alias"),
        "const_item" | "static_item" => Some("constant"),
        "function_declaration" => Some("function"),
        "class_declaration" => Some("class"),
        "interface_declaration" => Some("interface"),
        "type_alias_declaration" => Some("type_alias"),
        "method_definition" => Some("method"),
        "function_definition" => Some("function"),
        "class_definition" => Some("class"),
        _ => None,
    }
}

fn extract_name<'a>(node: &Node<'a>, source: &'a [u8]) -> Option<String> {
    for field in &["name", "type"] {
        if let Some(name_node) = node.child_by_field_name(*field) {
            if let Ok(text) = name_node.utf8_text(source) {
                let name = text.trim();
                if !name.is_empty() {
                    return Some(name.to_string());
                }
            }
        }
    }
    None
}

fn extract_signature(node: &Node, source: &[u8], family: LanguageFamily) -> String {
    let text = node.utf8_text(source).unwrap_or("");
    let first_line = text.lines().next().unwrap_or("").trim();
    let sig = if family == LanguageFamily::Python {
        match first_line.find(':') {
            Some(colon) => &first_line[..=colon],
            None => first_line,
        }
    } else {
        match first_line.find('{') {
            Some(brace) => first_line[..brace].trim(),
            None => first_line,
        }
    };
    if sig.chars().count() > 200 {
        sig.chars().take(200).collect::<String>() + "..."
    } else {
        sig.to_string()
    }
}

/// Declaration node kinds that bind a single local name, and the reason code
/// their occurrence is recorded under.
fn classify_bind_kind(kind: &str) -> Option<ReasonCode> {
    match kind {
        "let_declaration" | "variable_declarator" | "assignment" => Some(ReasonCode::LocalAssign),
        _ => None,
    }
}

fn is_bare_parameter_container(kind: &str) -> bool {
    matches!(kind, "formal_parameters" | "parameters")
}

fn is_wrapped_parameter(kind: &str) -> bool {
    matches!(kind, "parameter" | "required_parameter" | "optional_parameter")
}

fn is_reference_identifier(kind: &str) -> bool {
    matches!(kind, "identifier" | "type_identifier" | "field_identifier" | "shorthand_property_identifier")
}

/// Best-effort bound-name extraction for a let/variable/assignment/parameter
/// node: tries the field names used across the four kept grammars, skipping
/// destructuring patterns (no field resolves to a bare identifier).
fn extract_bind_name(node: &Node, source: &[u8]) -> Option<String> {
    for field in &["pattern", "name", "left"] {
        if let Some(n) = node.child_by_field_name(field) {
            if n.kind() == "identifier" {
                if let Ok(text) = n.utf8_text(source) {
                    return Some(text.to_string());
                }
            }
        }
    }
    None
}

#[allow(clippy::too_many_arguments)]
fn walk(
    node: &Node,
    source: &[u8],
    family: LanguageFamily,
    parent_idx: Option<usize>,
    parent_path: &str,
    defs: &mut Vec<DraftDef>,
    refs: &mut Vec<DraftRef>,
    binds: &mut Vec<DraftLocalBind>,
) {
    let kind = node.kind();
    if let Some(def_kind) = classify_def_kind(kind) {
        let name = extract_name(node, source).unwrap_or_else(|| "<anonymous>".to_string());
        let start = node.start_position();
        let end = node.end_position();
        let lexical_path = if parent_path.is_empty() { name.clone() } else { format!("{parent_path}::{name}") };
        let final_kind = if parent_idx.is_some() && def_kind == "function" { "method" } else { def_kind };

        defs.push(DraftDef {
            kind: final_kind.to_string(),
            simple_name: name,
            lexical_path: lexical_path.clone(),
            signature_text: extract_signature(node, source, family),
            start_line: (start.row + 1) as u32,
            start_col: start.column as u32,
            end_line: (end.row + 1) as u32,
            end_col: end.column as u32,
            parent: parent_idx,
        });
        let my_idx = defs.len() - 1;
        let mut cursor = node.walk();
        for child in node.children(&mut cursor) {
            walk(&child, source, family, Some(my_idx), &lexical_path, defs, refs, binds);
        }
        return;
    }

    if let Some(reason) = classify_bind_kind(kind) {
        if let (Some(scope), Some(name)) = (parent_idx, extract_bind_name(node, source)) {
            binds.push(DraftLocalBind { scope, name, reason_code: reason });
        }
    } else if is_wrapped_parameter(kind) {
        if let (Some(scope), Some(name)) = (parent_idx, extract_bind_name(node, source)) {
            binds.push(DraftLocalBind { scope, name, reason_code: ReasonCode::Param });
        }
    } else if kind == "identifier" && node.parent().map(|p| is_bare_parameter_container(p.kind())).unwrap_or(false) {
        if let (Some(scope), Ok(text)) = (parent_idx, node.utf8_text(source)) {
            binds.push(DraftLocalBind { scope, name: text.to_string(), reason_code: ReasonCode::Param });
        }
    } else if is_reference_identifier(kind) {
        if let Ok(text) = node.utf8_text(source) {
            if !text.is_empty() {
                let start = node.start_position();
                let is_member_access = matches!(kind, "field_identifier" | "shorthand_property_identifier");
                refs.push(DraftRef {
                    token_text: text.to_string(),
                    line: (start.row + 1) as u32,
                    col: start.column as u32,
                    scope: parent_idx,
                    role: RefRole::Reference,
                    is_member_access,
                });
            }
        }
    }

    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        walk(&child, source, family, parent_idx, parent_path, defs, refs, binds);
    }
}

struct ImportPattern {
    regex: &'static str,
    import_kind: &'static str,
}

fn import_patterns(family: LanguageFamily) -> &'static [ImportPattern] {
    match family {
        LanguageFamily::Rust => &[ImportPattern { regex: r#"^\s*use\s+([A-Za-z0-9_:]+(?:::\{[^}]*\})?)\s*;"#, import_kind: "use" }],
        LanguageFamily::TypeScript | LanguageFamily::JavaScript => &[
            ImportPattern { regex: r#"^\s*import\s+.*?\s+from\s+['"]([^'"]+)['"]"#, import_kind: "import" },
            ImportPattern { regex: r#"require\(\s*['"]([^'"]+)['"]\s*\)"#, import_kind: "require" },
        ],
        LanguageFamily::Python => &[
            ImportPattern { regex: r#"^\s*from\s+([A-Za-z0-9_.]+)\s+import\s+"#, import_kind: "from_import" },
            ImportPattern { regex: r#"^\s*import\s+([A-Za-z0-9_.]+)"#, import_kind: "import" },
        ],
    }
}

fn compiled(pattern: &'static str) -> &'static Regex {
    static CACHE: OnceLock<std::sync::Mutex<std::collections::HashMap<&'static str, &'static Regex>>> = OnceLock::new();
    let map = CACHE.get_or_init(|| std::sync::Mutex::new(std::collections::HashMap::new()));
    let mut guard = map.lock().unwrap();
    if let Some(re) = guard.get(pattern) {
        return re;
    }
    let re: &'static Regex = Box::leak(Box::new(Regex::new(pattern).expect("static import pattern is valid")));
    guard.insert(pattern, re);
    re
}

/// Declarative, line-oriented import extraction. Dynamic imports (computed
/// specifiers, `eval`-style loads) are not matched by these patterns and so
/// correctly yield no `ImportFact`, per §3's "dynamic imports yield no
/// ImportFact."
fn extract_imports(content: &str, family: LanguageFamily) -> Vec<DraftImport> {
    let mut out = Vec::new();
    for (i, line) in content.lines().enumerate() {
        for pattern in import_patterns(family) {
            if let Some(caps) = compiled(pattern.regex).captures(line) {
                let literal = caps.get(1).map(|m| m.as_str().to_string());
                if let Some(literal) = literal {
                    out.push(DraftImport {
                        imported_name: literal.clone(),
                        alias: None,
                        source_literal: Some(literal),
                        import_kind: pattern.import_kind.to_string(),
                        line: (i + 1) as u32,
                    });
                }
            }
        }
    }
    out
}

/// Declarative, line-oriented export extraction, same posture as
/// `extract_imports`: a name reachable only through computed re-export
/// machinery yields no `ExportEntry`, rather than a guessed one.
fn extract_exports(content: &str, family: LanguageFamily) -> Vec<DraftExportEntry> {
    let mut out = Vec::new();
    match family {
        LanguageFamily::Rust => {
            let re = compiled(r#"^\s*pub(?:\([^)]*\))?\s+(?:fn|struct|enum|trait|const|static|type)\s+([A-Za-z_][A-Za-z0-9_]*)"#);
            for line in content.lines() {
                if let Some(caps) = re.captures(line) {
                    out.push(DraftExportEntry { exported_name: caps[1].to_string(), certainty: Certainty::Certain, evidence_kind: "pub_keyword".into() });
                }
            }
        }
        LanguageFamily::TypeScript | LanguageFamily::JavaScript => {
            let named = compiled(r#"^\s*export\s+(?:default\s+)?(?:async\s+)?(?:function\*?|class|const|let|var|interface|type)\s+([A-Za-z_$][A-Za-z0-9_$]*)"#);
            let braced = compiled(r#"^\s*export\s*\{\s*([^}]+)\s*\}"#);
            for line in content.lines() {
                if let Some(caps) = named.captures(line) {
                    out.push(DraftExportEntry { exported_name: caps[1].to_string(), certainty: Certainty::Certain, evidence_kind: "export_keyword".into() });
                } else if let Some(caps) = braced.captures(line) {
                    for name in caps[1].split(',') {
                        let name = name.trim().split(" as ").next().unwrap_or("").trim();
                        if !name.is_empty() {
                            out.push(DraftExportEntry { exported_name: name.to_string(), certainty: Certainty::Certain, evidence_kind: "explicit_names".into() });
                        }
                    }
                }
            }
        }
        LanguageFamily::Python => {
            let all_re = compiled(r#"^__all__\s*=\s*\[([^\]]*)\]"#);
            let mut found_all = false;
            for line in content.lines() {
                if let Some(caps) = all_re.captures(line) {
                    found_all = true;
                    for name in caps[1].split(',') {
                        let name = name.trim().trim_matches(|c| c == '\'' || c == '"');
                        if !name.is_empty() {
                            out.push(DraftExportEntry { exported_name: name.to_string(), certainty: Certainty::Certain, evidence_kind: "dunder_all".into() });
                        }
                    }
                }
            }
            if !found_all {
                let def_re = compiled(r#"^(?:def|class)\s+([A-Za-z_][A-Za-z0-9_]*)"#);
                for line in content.lines() {
                    if let Some(caps) = def_re.captures(line) {
                        let name = &caps[1];
                        if !name.starts_with('_') {
                            out.push(DraftExportEntry { exported_name: name.to_string(), certainty: Certainty::Uncertain, evidence_kind: "public_convention".into() });
                        }
                    }
                }
            }
        }
    }
    out
}

/// Line-oriented dynamic-access detection: member access whose key isn't a
/// literal at the syntax level (`obj[expr]`, `getattr(obj, name)`). Rust has
/// no reflective member access, so it always yields an empty list.
fn extract_dynamic_access(content: &str, family: LanguageFamily) -> Vec<DraftDynamicAccessSite> {
    let mut out = Vec::new();
    match family {
        LanguageFamily::Rust => {}
        LanguageFamily::Python => {
            let re = compiled(r#"getattr\(\s*[^,]+,\s*(['"])?([A-Za-z_][A-Za-z0-9_]*)['"]?\s*[,)]"#);
            for (i, line) in content.lines().enumerate() {
                for caps in re.captures_iter(line) {
                    let literal = if caps.get(1).is_some() { Some(caps[2].to_string()) } else { None };
                    out.push(DraftDynamicAccessSite { pattern: "getattr".into(), literal, line: (i + 1) as u32 });
                }
            }
        }
        LanguageFamily::TypeScript | LanguageFamily::JavaScript => {
            let literal_re = compiled(r#"\[\s*(?:'([^']+)'|"([^"]+)")\s*\]"#);
            let dynamic_re = compiled(r#"\[\s*([A-Za-z_$][A-Za-z0-9_$.]*)\s*\]"#);
            for (i, line) in content.lines().enumerate() {
                for caps in literal_re.captures_iter(line) {
                    let literal = caps.get(1).or_else(|| caps.get(2)).map(|m| m.as_str().to_string());
                    out.push(DraftDynamicAccessSite { pattern: "bracket_member".into(), literal, line: (i + 1) as u32 });
                }
                for caps in dynamic_re.captures_iter(line) {
                    out.push(DraftDynamicAccessSite { pattern: "bracket_member".into(), literal: None, line: (i + 1) as u32 });
                }
            }
        }
    }
    out
}

pub fn parse_with_treesitter(content: &str, family: LanguageFamily) -> Option<ParseOutcome> {
    let language = language_for(family);
    let mut parser = Parser::new();
    parser.set_language(&language).ok()?;
    let tree = parser.parse(content, None)?;
    let root = tree.root_node();

    let mut defs = Vec::new();
    let mut refs = Vec::new();
    let mut local_binds = Vec::new();
    walk(&root, content.as_bytes(), family, None, "", &mut defs, &mut refs, &mut local_binds);

    let scopes = defs.iter().map(|d| DraftScope { kind: d.kind.clone(), parent: d.parent }).collect();
    let imports = extract_imports(content, family);
    let exports = extract_exports(content, family);
    let dynamic_access = extract_dynamic_access(content, family);

    Some(ParseOutcome { defs, imports, scopes, refs, local_binds, exports, dynamic_access })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_rust_function_definition() {
        let outcome = parse_with_treesitter("fn greet(name: &str) -> String {\n    name.to_string()\n}\n", LanguageFamily::Rust).unwrap();
        assert_eq!(outcome.defs.len(), 1);
        assert_eq!(outcome.defs[0].simple_name, "greet");
        assert_eq!(outcome.defs[0].kind, "function");
    }

    #[test]
    fn extracts_rust_use_import() {
        let outcome = parse_with_treesitter("use crate::util::helper;\nfn f() {}\n", LanguageFamily::Rust).unwrap();
        assert_eq!(outcome.imports.len(), 1);
        assert_eq!(outcome.imports[0].source_literal.as_deref(), Some("crate::util::helper"));
    }

    #[test]
    fn methods_inside_impl_become_methods() {
        let src = "impl Foo {\n    fn bar(&self) {}\n}\n";
        let outcome = parse_with_treesitter(src, LanguageFamily::Rust).unwrap();
        let bar = outcome.defs.iter().find(|d| d.simple_name == "bar").unwrap();
        assert_eq!(bar.kind, "method");
    }

    #[test]
    fn python_function_and_import() {
        let src = "from pkg.util import helper\n\ndef run():\n    return helper()\n";
        let outcome = parse_with_treesitter(src, LanguageFamily::Python).unwrap();
        assert!(outcome.defs.iter().any(|d| d.simple_name == "run"));
        assert_eq!(outcome.imports[0].source_literal.as_deref(), Some("pkg.util"));
    }

    #[test]
    fn typescript_import_from_is_captured() {
        let src = "import { helper } from './util';\nfunction run() {}\n";
        let outcome = parse_with_treesitter(src, LanguageFamily::TypeScript).unwrap();
        assert_eq!(outcome.imports[0].source_literal.as_deref(), Some("./util"));
    }

    #[test]
    fn rust_function_has_one_scope_with_param_bind() {
        let src = "fn add(x: i32, y: i32) -> i32 {\n    x + y\n}\n";
        let outcome = parse_with_treesitter(src, LanguageFamily::Rust).unwrap();
        assert_eq!(outcome.scopes.len(), 1);
        let names: Vec<&str> = outcome.local_binds.iter().map(|b| b.name.as_str()).collect();
        assert!(names.contains(&"x"));
        assert!(names.contains(&"y"));
        assert!(outcome.refs.iter().any(|r| r.token_text == "x"));
    }

    #[test]
    fn rust_pub_fn_is_exported() {
        let src = "pub fn greet() {}\nfn helper() {}\n";
        let outcome = parse_with_treesitter(src, LanguageFamily::Rust).unwrap();
        assert_eq!(outcome.exports.len(), 1);
        assert_eq!(outcome.exports[0].exported_name, "greet");
    }

    #[test]
    fn python_dunder_all_is_export_surface() {
        let src = "__all__ = ['run', 'helper']\n\ndef run():\n    pass\n\ndef helper():\n    pass\n";
        let outcome = parse_with_treesitter(src, LanguageFamily::Python).unwrap();
        assert_eq!(outcome.exports.len(), 2);
    }

    #[test]
    fn javascript_bracket_access_is_a_dynamic_site() {
        let src = "function run(obj, key) {\n    return obj[key];\n}\n";
        let outcome = parse_with_treesitter(src, LanguageFamily::JavaScript).unwrap();
        assert!(outcome.dynamic_access.iter().any(|d| d.pattern == "bracket_member" && d.literal.is_none()));
    }

    #[test]
    fn rust_has_no_dynamic_access_sites() {
        let src = "fn f(v: Vec<i32>) -> i32 {\n    v[0]\n}\n";
        let outcome = parse_with_treesitter(src, LanguageFamily::Rust).unwrap();
        assert!(outcome.dynamic_access.is_empty());
    }
}
