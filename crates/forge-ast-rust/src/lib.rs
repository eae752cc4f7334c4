//! Rust source adapter for the symbol-level incremental analyzer: extracts
//! one [`AstSymbol`] per top-level `fn`/`struct`/`enum`/`trait`/`mod`/`impl`
//! item via `syn`, instead of treating a whole file as one unit. Nested
//! items (methods inside an `impl`, functions inside an inline `mod { }`)
//! are folded into their enclosing symbol rather than becoming symbols of
//! their own -- good enough to isolate "a definition a human would name"
//! without a second pass to resolve intra-block dependents.
//!
//! `mod foo;` declarations (the Rust analog of an `#include`) become
//! `includes` entries so the analyzer's file-level dependents graph covers
//! Rust's own module system; `use` paths are not included here, since they
//! name crate-qualified symbols rather than files and the resolver only
//! ever matches file-shaped strings.

use std::collections::BTreeSet;
use std::path::Path;

use syn::spanned::Spanned;
use syn::visit::Visit;

use forge_core::dep_analyzer::{AstParser, AstSymbol, FileAst, SymbolKind};
use forge_core::error::{BuildError, BuildResult, ErrorKind};
use forge_core::fingerprint::Fingerprint;

/// Parses `.rs` files for [`forge_core::dep_analyzer::DepAnalyzer`].
#[derive(Debug, Default)]
pub struct RustAstParser;

impl RustAstParser {
    pub fn new() -> Self {
        Self
    }
}

impl AstParser for RustAstParser {
    fn parse_file(&self, path: &Path, parsed_at: u64) -> BuildResult<FileAst> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| BuildError::io("IO_READ_FAILED", &e, path).wrap("reading rust source"))?;
        self.parse_content(&content, path, parsed_at)
    }

    fn parse_content(&self, content: &str, path: &Path, parsed_at: u64) -> BuildResult<FileAst> {
        let file = syn::parse_file(content).map_err(|e| {
            BuildError::new(ErrorKind::Parse, "AST_PARSE_FAILED", e.to_string())
                .with_file(path.to_path_buf())
        })?;

        let lines: Vec<&str> = content.lines().collect();
        let mut symbols = Vec::new();
        let mut includes = Vec::new();

        for item in &file.items {
            symbol_for_item(item, &lines).into_iter().for_each(|s| symbols.push(s));
        }
        collect_mod_includes(&file.items, &mut includes);

        Ok(FileAst {
            file_path: path.to_path_buf(),
            file_hash: Fingerprint::of_bytes(content.as_bytes()),
            parsed_at,
            symbols,
            includes,
        })
    }
}

fn symbol_for_item(item: &syn::Item, lines: &[&str]) -> Option<AstSymbol> {
    let (name, kind, signature) = match item {
        syn::Item::Fn(f) => (f.sig.ident.to_string(), SymbolKind::Function, signature_of_fn(&f.sig)),
        syn::Item::Struct(s) => (s.ident.to_string(), SymbolKind::Struct, format!("struct {}", s.ident)),
        syn::Item::Enum(e) => (e.ident.to_string(), SymbolKind::Class, format!("enum {}", e.ident)),
        syn::Item::Trait(t) => (t.ident.to_string(), SymbolKind::Class, format!("trait {}", t.ident)),
        syn::Item::Mod(m) => (m.ident.to_string(), SymbolKind::Module, format!("mod {}", m.ident)),
        syn::Item::Impl(i) => (impl_name(i)?, SymbolKind::Namespace, impl_signature(i)),
        _ => return None,
    };

    let span = item.span();
    let start_line = span.start().line as u32;
    let end_line = span.end().line.max(span.start().line) as u32;

    let mut collector = RefCollector::default();
    collector.visit_item(item);

    Some(AstSymbol {
        name,
        kind,
        start_line,
        end_line,
        signature,
        content_hash: hash_span(lines, start_line, end_line),
        dependencies: collector.dependencies,
        used_types: collector.used_types,
    })
}

fn signature_of_fn(sig: &syn::Signature) -> String {
    let is_async = sig.asyncness.is_some();
    let is_unsafe = sig.unsafety.is_some();
    format!(
        "{}{}fn {}({} params)",
        if is_unsafe { "unsafe " } else { "" },
        if is_async { "async " } else { "" },
        sig.ident,
        sig.inputs.len(),
    )
}

fn impl_name(item: &syn::ItemImpl) -> Option<String> {
    let syn::Type::Path(type_path) = item.self_ty.as_ref() else { return None };
    let type_name = type_path.path.segments.last()?.ident.to_string();
    match &item.trait_ {
        Some((_, trait_path, _)) => {
            let trait_name = trait_path.segments.last()?.ident.to_string();
            Some(format!("{type_name}:{trait_name}"))
        }
        None => Some(type_name),
    }
}

fn impl_signature(item: &syn::ItemImpl) -> String {
    match impl_name(item) {
        Some(name) => format!("impl {name}"),
        None => "impl <unnamed self type>".to_string(),
    }
}

/// Walks a span's source lines, stripping trailing `//` comments before
/// hashing, so reformatting or re-commenting a symbol's body alone never
/// marks it dirty.
fn hash_span(lines: &[&str], start_line: u32, end_line: u32) -> Fingerprint {
    let start = (start_line.saturating_sub(1) as usize).min(lines.len());
    let end = (end_line as usize).min(lines.len());
    let mut stripped = String::new();
    for line in &lines[start..end] {
        stripped.push_str(strip_line_comment(line));
        stripped.push('\n');
    }
    Fingerprint::of_bytes(stripped.as_bytes())
}

/// Naive `//`-comment stripping. Doesn't understand string literals
/// containing `//`, which can under-invalidate a symbol that changed only
/// inside such a literal; acceptable for the same reason the reference
/// `mod foo;` scanner below is line-based rather than a full tokenizer pass.
fn strip_line_comment(line: &str) -> &str {
    match line.find("//") {
        Some(idx) => line[..idx].trim_end(),
        None => line.trim_end(),
    }
}

/// Collects `mod foo;` (file-backed, no inline body) declarations anywhere
/// in `items`, recursing into inline `mod foo { .. }` bodies since those
/// still name real file dependencies of the file being parsed. Emits both
/// candidate file names per declaration (`foo.rs` and `foo/mod.rs`) and
/// lets `IncludeResolver` find whichever exists.
fn collect_mod_includes(items: &[syn::Item], out: &mut Vec<String>) {
    for item in items {
        if let syn::Item::Mod(m) = item {
            match &m.content {
                None => {
                    out.push(format!("{}.rs", m.ident));
                    out.push(format!("{}/mod.rs", m.ident));
                }
                Some((_, nested)) => collect_mod_includes(nested, out),
            }
        }
    }
}

#[derive(Default)]
struct RefCollector {
    used_types: BTreeSet<String>,
    dependencies: BTreeSet<String>,
}

impl<'ast> Visit<'ast> for RefCollector {
    fn visit_type_path(&mut self, node: &'ast syn::TypePath) {
        if let Some(seg) = node.path.segments.last() {
            self.used_types.insert(seg.ident.to_string());
            self.dependencies.insert(seg.ident.to_string());
        }
        syn::visit::visit_type_path(self, node);
    }

    fn visit_expr_path(&mut self, node: &'ast syn::ExprPath) {
        if let Some(seg) = node.path.segments.last() {
            self.dependencies.insert(seg.ident.to_string());
        }
        syn::visit::visit_expr_path(self, node);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_top_level_fn_and_struct_symbols() {
        let parser = RustAstParser::new();
        let source = "struct Widget;\n\nfn build(w: Widget) -> Widget {\n    w\n}\n";
        let ast = parser.parse_content(source, Path::new("lib.rs"), 0).unwrap();

        let names: BTreeSet<&str> = ast.symbols.iter().map(|s| s.name.as_str()).collect();
        assert!(names.contains("Widget"));
        assert!(names.contains("build"));

        let build = ast.symbols.iter().find(|s| s.name == "build").unwrap();
        assert!(build.used_types.contains("Widget"));
    }

    #[test]
    fn unchanged_symbol_text_keeps_same_hash_across_comment_only_edits() {
        let parser = RustAstParser::new();
        let a = parser.parse_content("fn f() { 1; }\n", Path::new("a.rs"), 0).unwrap();
        let b = parser.parse_content("fn f() { 1; } // now commented\n", Path::new("a.rs"), 0).unwrap();
        assert_eq!(a.symbols[0].content_hash, b.symbols[0].content_hash);
    }

    #[test]
    fn file_backed_mod_declaration_becomes_an_include() {
        let parser = RustAstParser::new();
        let ast = parser.parse_content("mod helper;\n", Path::new("lib.rs"), 0).unwrap();
        assert!(ast.includes.contains(&"helper.rs".to_string()));
        assert!(ast.includes.contains(&"helper/mod.rs".to_string()));
    }

    #[test]
    fn inline_mod_does_not_produce_an_include_but_its_nested_file_mod_does() {
        let parser = RustAstParser::new();
        let ast = parser.parse_content("mod outer {\n    mod inner;\n}\n", Path::new("lib.rs"), 0).unwrap();
        assert!(!ast.includes.iter().any(|i| i.starts_with("outer")));
        assert!(ast.includes.contains(&"inner.rs".to_string()));
    }

    #[test]
    fn invalid_source_is_a_parse_error_not_a_panic() {
        let parser = RustAstParser::new();
        let err = parser.parse_content("fn (", Path::new("broken.rs"), 0).unwrap_err();
        assert_eq!(err.code, "AST_PARSE_FAILED");
    }
}
