//! Macro/routine call substitution, `.INCLUDE`/`.INCLUDE_STRICT`
//! deduplication, and `.IMPORT` aliasing.
//!
//! Expansion walks the residual line stream produced by
//! [`crate::definitions::extract`], substituting callable bodies in place
//! with `@@`-hygienic renaming of any labels the body declares, and
//! tracking the stack of in-progress expansions to reject cycles —
//! the same "names currently being resolved" stack `cranelift-reader`
//! uses to catch mutually-recursive function references, generalized
//! here from a read-only check to an actual text-substitution pass.

use hashbrown::{HashMap, HashSet};
use log::debug;

use crate::definitions::{CallableDef, DefinitionTables};
use crate::error::{asm_err, AssemblyResult};
use crate::source::Line;

/// Expansion stops recursing past this depth, guarding against a cycle the
/// definition tables alone don't reveal (e.g. a macro whose expansion
/// depends on the call-site arguments).
pub const MAX_EXPANSION_DEPTH: usize = 100;

/// One `.INCLUDE`/`.INCLUDE_STRICT` request: a file name and the raw source
/// text a host would have read from disk. This crate's Non-goals exclude
/// file I/O, so callers supply already-loaded text.
pub struct IncludeSource {
    pub file: String,
    pub text: String,
}

/// Everything the expander needs beyond the residual stream itself: the
/// local definition tables, and any included files' tables (keyed by file
/// name, pre-extracted by the caller).
pub struct ExpanderContext<'a> {
    pub tables: &'a DefinitionTables,
    pub includes: &'a HashMap<String, DefinitionTables>,
}

/// Word-boundary replace every occurrence of `name` in `text` with
/// `replacement`. Matches are bounded by non-identifier characters so that
/// a parameter named `X` does not also rewrite inside `DRX`.
fn replace_word(text: &str, name: &str, replacement: &str) -> String {
    let is_ident = |c: char| c.is_alphanumeric() || c == '_' || c == '.';
    let mut out = String::with_capacity(text.len());
    let bytes = text.as_bytes();
    let mut i = 0;
    while i < text.len() {
        if text[i..].starts_with(name) {
            let before_ok = i == 0 || !is_ident(bytes[i - 1] as char);
            let after = i + name.len();
            let after_ok = after >= text.len() || !is_ident(text.as_bytes()[after] as char);
            if before_ok && after_ok {
                out.push_str(replacement);
                i = after;
                continue;
            }
        }
        let ch = text[i..].chars().next().unwrap();
        out.push(ch);
        i += ch.len_utf8();
    }
    out
}

/// Substitute every `.DEFINE`d name in `text` with its replacement token,
/// word-boundary matched the same way parameter binding is.
fn apply_defines(text: &str, defines: &HashMap<String, String>) -> String {
    let mut out = text.to_string();
    for (name, value) in defines {
        out = replace_word(&out, name, value);
    }
    out
}

/// Rewrite every label-looking token (a bare identifier ending in `:`, or
/// referenced bare elsewhere in the body) with a `@@`-suffixed hygienic
/// name unique to this call site, so that two expansions of the same
/// macro never collide on a label.
fn hygienic_rename(body: &[Line], call_site_tag: &str) -> Vec<Line> {
    let mut labels = HashSet::new();
    for line in body {
        if let Some(stripped) = line.text.strip_suffix(':') {
            if let Some(label) = stripped.split_whitespace().next() {
                labels.insert(label.to_string());
            }
        }
    }
    body.iter()
        .map(|line| {
            let mut text = line.text.clone();
            for label in &labels {
                let renamed = format!("{label}@@{call_site_tag}");
                text = replace_word(&text, label, &renamed);
            }
            Line::new(text, format!("<expansion {call_site_tag}>"), line.location.line)
        })
        .collect()
}

fn bind_params(body: &[Line], def: &CallableDef, args: &[&str]) -> AssemblyResult<Vec<Line>> {
    Ok(body
        .iter()
        .map(|line| {
            let mut text = line.text.clone();
            for (param, arg) in def.params.iter().zip(args.iter()) {
                text = replace_word(&text, param, arg);
            }
            Line::new(text, line.location.file.clone(), line.location.line)
        })
        .collect())
}

/// Parsed `.INCLUDE name AS instance WITH args…` (or `.INCLUDE_STRICT …`).
struct IncludeDirective {
    name: String,
    instance: String,
    args: Vec<String>,
    strict: bool,
}

fn parse_include(line: &Line, strict: bool) -> AssemblyResult<IncludeDirective> {
    let mut parts = line.rest().split_whitespace();
    let name = parts.next().map(str::to_string).ok_or_else(|| {
        crate::error::AssemblyError::new(
            line.location.clone(),
            line.text.clone(),
            crate::error::AssemblyErrorKind::Syntax(".INCLUDE requires a routine name".to_string()),
        )
    })?;
    let as_kw = parts.next();
    if as_kw != Some("AS") {
        return asm_err!(line.location, line.text.clone(), Syntax, ".INCLUDE {name} requires an AS clause");
    }
    let instance = parts.next().map(str::to_string).ok_or_else(|| {
        crate::error::AssemblyError::new(
            line.location.clone(),
            line.text.clone(),
            crate::error::AssemblyErrorKind::Syntax(format!(".INCLUDE {name} AS requires an instance name")),
        )
    })?;
    let with_kw = parts.next();
    let args = match with_kw {
        Some("WITH") => parts.map(str::to_string).collect(),
        Some(_) | None => Vec::new(),
    };
    Ok(IncludeDirective { name, instance, args, strict })
}

/// Parsed `.IMPORT proc AS alias`.
struct ImportDirective {
    proc: String,
    alias: String,
}

fn parse_import(line: &Line) -> AssemblyResult<ImportDirective> {
    let mut parts = line.rest().split_whitespace();
    let proc = parts.next().map(str::to_string).ok_or_else(|| {
        crate::error::AssemblyError::new(
            line.location.clone(),
            line.text.clone(),
            crate::error::AssemblyErrorKind::Syntax(".IMPORT requires a procedure name".to_string()),
        )
    })?;
    if parts.next() != Some("AS") {
        return asm_err!(line.location, line.text.clone(), Syntax, ".IMPORT {proc} requires an AS clause");
    }
    let alias = parts.next().map(str::to_string).ok_or_else(|| {
        crate::error::AssemblyError::new(
            line.location.clone(),
            line.text.clone(),
            crate::error::AssemblyErrorKind::Syntax(format!(".IMPORT {proc} AS requires an alias")),
        )
    })?;
    Ok(ImportDirective { proc, alias })
}

struct Expander<'a> {
    ctx: &'a ExpanderContext<'a>,
    call_counter: usize,
    /// `(routine name, args)` signatures already expanded by `.INCLUDE`,
    /// mapped to the label of the primary instance — later occurrences of
    /// the same signature become a one-instruction trampoline instead of a
    /// second full expansion.
    seen_includes: HashMap<(String, Vec<String>), String>,
}

impl<'a> Expander<'a> {
    fn expand_lines(&mut self, lines: &[Line], stack: &mut Vec<String>) -> AssemblyResult<Vec<Line>> {
        let mut out = Vec::with_capacity(lines.len());
        for line in lines {
            out.extend(self.expand_line(line, stack)?);
        }
        Ok(out)
    }

    fn expand_line(&mut self, line: &Line, stack: &mut Vec<String>) -> AssemblyResult<Vec<Line>> {
        let substituted = apply_defines(&line.text, &self.ctx.tables.defines);
        let line = &Line::new(substituted, line.location.file.clone(), line.location.line);

        let head = match line.head() {
            Some(h) => h,
            None => return Ok(vec![line.clone()]),
        };

        if head == ".IMPORT" {
            let import = parse_import(line)?;
            return Ok(vec![
                Line::new(format!("{}:", import.alias), line.location.file.clone(), line.location.line),
                Line::new(format!("JMPI {}", import.proc), line.location.file.clone(), line.location.line),
            ]);
        }

        if head == ".INCLUDE" || head == ".INCLUDE_STRICT" {
            return self.expand_include(line, stack);
        }

        let def = match self.ctx.tables.callables.get(head) {
            Some(def) => def,
            None => return Ok(vec![line.clone()]),
        };

        if stack.iter().any(|n| n == head) {
            return asm_err!(
                line.location,
                line.text.clone(),
                Recursion,
                "expansion cycle: {head} calls itself (directly or indirectly)"
            );
        }
        if stack.len() >= MAX_EXPANSION_DEPTH {
            return asm_err!(
                line.location,
                line.text.clone(),
                Recursion,
                "macro/routine expansion exceeded depth {MAX_EXPANSION_DEPTH}"
            );
        }

        let args: Vec<&str> = line.rest().split_whitespace().collect();
        if args.len() != def.params.len() {
            return asm_err!(
                line.location,
                line.text.clone(),
                Arity,
                "{head} expects {} argument(s), found {}",
                def.params.len(),
                args.len()
            );
        }

        self.call_counter += 1;
        let tag = format!("{head}_{}", self.call_counter);
        let bound = bind_params(&def.body, def, &args)?;
        let renamed = hygienic_rename(&bound, &tag);

        stack.push(head.to_string());
        let expanded = self.expand_lines(&renamed, stack)?;
        stack.pop();
        Ok(expanded)
    }

    fn expand_include(&mut self, line: &Line, stack: &mut Vec<String>) -> AssemblyResult<Vec<Line>> {
        let strict = line.head() == Some(".INCLUDE_STRICT");
        let directive = parse_include(line, strict)?;
        let def = self.ctx.tables.callables.get(&directive.name).ok_or_else(|| {
            crate::error::AssemblyError::new(
                line.location.clone(),
                line.text.clone(),
                crate::error::AssemblyErrorKind::Semantic(format!("no routine named {} to include", directive.name)),
            )
        })?;
        if directive.args.len() != def.params.len() {
            return asm_err!(
                line.location,
                line.text.clone(),
                Arity,
                "{} expects {} argument(s), found {}",
                directive.name,
                def.params.len(),
                directive.args.len()
            );
        }

        let signature = (directive.name.clone(), directive.args.clone());
        if !directive.strict {
            if let Some(primary) = self.seen_includes.get(&signature) {
                return Ok(vec![
                    Line::new(format!("{}:", directive.instance), line.location.file.clone(), line.location.line),
                    Line::new(format!("JMPI {primary}"), line.location.file.clone(), line.location.line),
                ]);
            }
        }

        let args: Vec<&str> = directive.args.iter().map(String::as_str).collect();
        let bound = bind_params(&def.body, def, &args)?;
        let renamed = hygienic_rename(&bound, &directive.instance);
        let mut out = vec![Line::new(
            format!("{}:", directive.instance),
            line.location.file.clone(),
            line.location.line,
        )];

        stack.push(directive.name.clone());
        out.extend(self.expand_lines(&renamed, stack)?);
        stack.pop();

        if !directive.strict {
            self.seen_includes.insert(signature, directive.instance.clone());
        }
        Ok(out)
    }
}

/// The residual main-code stream plus every `.PROC` body, each
/// independently macro/routine-expanded. A `.PROC`'s body is assembled
/// lazily in the sense that it never runs until called, but it is still
/// expanded here, alongside the residual stream, so that a macro call
/// inside a procedure's body is substituted the same way a call in the
/// main line is.
#[derive(Debug)]
pub struct ExpandedProgram {
    /// The main-code stream, with every macro/routine/include/import
    /// reference substituted.
    pub residual: Vec<Line>,
    /// Each `.PROC`'s expanded body, keyed by procedure name.
    pub procs: HashMap<String, Vec<Line>>,
}

/// Expand every macro/routine call in `tables.residual` and every `.PROC`
/// body, substituting bodies recursively (depth-bounded, cycle-checked) and
/// applying `@@`-hygienic label renaming per call site. One [`Expander`]
/// (and so one shared call-site counter) is used for both so that a macro
/// called once from the residual stream and once from inside a `.PROC`
/// body never produce colliding hygienic tags.
pub fn expand(ctx: &ExpanderContext) -> AssemblyResult<ExpandedProgram> {
    let mut expander = Expander {
        ctx,
        call_counter: 0,
        seen_includes: HashMap::new(),
    };
    let mut stack = Vec::new();
    let residual = expander.expand_lines(&ctx.tables.residual, &mut stack)?;
    debug!(
        "expanded residual stream: {} lines -> {} lines ({} call sites)",
        ctx.tables.residual.len(),
        residual.len(),
        expander.call_counter
    );

    let mut proc_names: Vec<&String> = ctx.tables.procs.keys().collect();
    proc_names.sort();
    let mut procs = HashMap::new();
    for name in proc_names {
        let def = &ctx.tables.procs[name];
        let mut stack = Vec::new();
        let body = expander.expand_lines(&def.body, &mut stack)?;
        debug!("expanded .PROC {name} body: {} lines -> {} lines", def.body.len(), body.len());
        procs.insert(name.clone(), body);
    }
    Ok(ExpandedProgram { residual, procs })
}

/// Resolve cross-file source loading for a host that splits a program
/// across files (distinct from the in-stream `.INCLUDE name AS instance
/// WITH args…` routine-instancing directive `expand_include` handles
/// above): returns `None` when `file` has already been loaded
/// (deduplication) and `Some(text)` otherwise. `strict` re-raises an error
/// if the file is missing from `sources`; non-strict silently skips a
/// missing file.
pub fn resolve_include<'a>(
    file: &str,
    strict: bool,
    sources: &'a HashMap<String, IncludeSource>,
    already_included: &mut HashSet<String>,
    location: &crate::error::Location,
) -> AssemblyResult<Option<&'a str>> {
    if !already_included.insert(file.to_string()) {
        return Ok(None);
    }
    match sources.get(file) {
        Some(src) => Ok(Some(&src.text)),
        None if strict => asm_err!(
            location,
            file.to_string(),
            Resolver,
            "included file {file} was not supplied"
        ),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definitions::extract;
    use crate::source::LineSource;

    fn tables(src: &str) -> DefinitionTables {
        let lines: Vec<Line> = LineSource::new("t.asm", src).non_blank().cloned().collect();
        extract(&lines).unwrap()
    }

    #[test]
    fn macro_call_is_substituted_with_bound_params() {
        let t = tables(".MACRO INC r\nADDI %r 1\n.ENDM\nINC %DR0\n");
        let ctx = ExpanderContext {
            tables: &t,
            includes: &HashMap::new(),
        };
        let out = expand(&ctx).unwrap().residual;
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].text, "ADDI %DR0 1");
    }

    #[test]
    fn define_is_substituted_into_residual_lines() {
        let t = tables(".DEFINE SPEED 3\nADDI %DR0 SPEED\n");
        let ctx = ExpanderContext {
            tables: &t,
            includes: &HashMap::new(),
        };
        let out = expand(&ctx).unwrap().residual;
        assert_eq!(out[0].text, "ADDI %DR0 3");
    }

    #[test]
    fn wrong_arity_call_is_rejected() {
        let t = tables(".MACRO INC r\nADDI %r 1\n.ENDM\nINC\n");
        let ctx = ExpanderContext {
            tables: &t,
            includes: &HashMap::new(),
        };
        let err = expand(&ctx).unwrap_err();
        assert!(matches!(err.kind, crate::error::AssemblyErrorKind::Arity(_)));
    }

    #[test]
    fn self_recursive_macro_is_a_cycle_error() {
        let t = tables(".MACRO LOOP\nLOOP\n.ENDM\nLOOP\n");
        let ctx = ExpanderContext {
            tables: &t,
            includes: &HashMap::new(),
        };
        let err = expand(&ctx).unwrap_err();
        assert!(matches!(err.kind, crate::error::AssemblyErrorKind::Recursion(_)));
    }

    #[test]
    fn labels_are_hygienically_renamed_per_call_site() {
        let t = tables(".MACRO TAG\nL:\nJMPR L\n.ENDM\nTAG\nTAG\n");
        let ctx = ExpanderContext {
            tables: &t,
            includes: &HashMap::new(),
        };
        let out = expand(&ctx).unwrap().residual;
        // two calls, each with its own L@@TAG_n label, never colliding
        assert_ne!(out[0].text, out[2].text);
        assert!(out[0].text.starts_with("L@@TAG_1"));
        assert!(out[2].text.starts_with("L@@TAG_2"));
    }

    #[test]
    fn include_is_only_returned_once() {
        let mut sources = HashMap::new();
        sources.insert(
            "lib.asm".to_string(),
            IncludeSource {
                file: "lib.asm".to_string(),
                text: "NOP\n".to_string(),
            },
        );
        let mut seen = HashSet::new();
        let loc = crate::error::Location::new("t.asm", 1);
        let first = resolve_include("lib.asm", false, &sources, &mut seen, &loc).unwrap();
        let second = resolve_include("lib.asm", false, &sources, &mut seen, &loc).unwrap();
        assert!(first.is_some());
        assert!(second.is_none());
    }

    #[test]
    fn strict_include_of_a_missing_file_errors() {
        let sources = HashMap::new();
        let mut seen = HashSet::new();
        let loc = crate::error::Location::new("t.asm", 1);
        let err = resolve_include("missing.asm", true, &sources, &mut seen, &loc).unwrap_err();
        assert!(matches!(err.kind, crate::error::AssemblyErrorKind::Resolver(_)));
    }

    #[test]
    fn include_directive_expands_first_instance_under_its_label() {
        let t = tables(".ROUTINE R x\nADDI %x 1\n.ENDR\n.INCLUDE R AS A WITH %DR0\n");
        let ctx = ExpanderContext {
            tables: &t,
            includes: &HashMap::new(),
        };
        let out = expand(&ctx).unwrap().residual;
        assert_eq!(out[0].text, "A:");
        assert_eq!(out[1].text, "ADDI %DR0 1");
    }

    #[test]
    fn second_include_with_same_signature_is_a_trampoline() {
        let t = tables(".ROUTINE R x\nADDI %x 1\n.ENDR\n.INCLUDE R AS A WITH %DR0\n.INCLUDE R AS B WITH %DR0\n");
        let ctx = ExpanderContext {
            tables: &t,
            includes: &HashMap::new(),
        };
        let out = expand(&ctx).unwrap().residual;
        let texts: Vec<&str> = out.iter().map(|l| l.text.as_str()).collect();
        assert_eq!(&texts[2..], ["B:", "JMPI A"]);
    }

    #[test]
    fn include_strict_always_expands_in_full() {
        let t = tables(".ROUTINE R x\nADDI %x 1\n.ENDR\n.INCLUDE_STRICT R AS A WITH %DR0\n.INCLUDE_STRICT R AS B WITH %DR0\n");
        let ctx = ExpanderContext {
            tables: &t,
            includes: &HashMap::new(),
        };
        let out = expand(&ctx).unwrap().residual;
        let texts: Vec<&str> = out.iter().map(|l| l.text.as_str()).collect();
        assert_eq!(texts, ["A:", "ADDI %DR0 1", "B:", "ADDI %DR0 1"]);
    }

    #[test]
    fn import_emits_an_alias_trampoline() {
        let t = tables(".IMPORT SQUARE AS SQ\n");
        let ctx = ExpanderContext {
            tables: &t,
            includes: &HashMap::new(),
        };
        let out = expand(&ctx).unwrap().residual;
        assert_eq!(out[0].text, "SQ:");
        assert_eq!(out[1].text, "JMPI SQUARE");
    }
}
