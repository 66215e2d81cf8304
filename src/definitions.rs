//! Extraction of `.MACRO`/`.ROUTINE`/`.PROC`/`.DEFINE` blocks from a flat
//! line stream into named tables, leaving behind the residual main-line
//! stream the expander walks.
//!
//! Shaped like `cranelift-reader`'s single forward-scanning parser: one
//! pass over [`Line`]s, pushed onto an explicit block stack rather than
//! recursing, so that "a block directive nested where nesting isn't
//! allowed" is a simple stack-depth check instead of a parser-combinator
//! failure mode.

use hashbrown::HashMap;

use crate::error::{asm_err, AssemblyResult};
use crate::source::Line;

/// A `.MACRO` or `.ROUTINE` definition: textually substituted at call
/// sites by the expander, with formal parameters bound by position.
#[derive(Debug, Clone)]
pub struct CallableDef {
    /// The callable's declared name.
    pub name: String,
    /// Formal parameter names, in declaration order.
    pub params: Vec<String>,
    /// The callable's body, unexpanded.
    pub body: Vec<Line>,
}

/// Which calling convention a `.PROC` uses: register-ABI procedures bind
/// formal parameters into `DR` slots `0..k-1` (callers must use `.WITH`),
/// stack-ABI procedures expect callers to have already pushed their
/// arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcAbi {
    /// Parameters arrive in `DR[0..k-1]`, bound by a `.WITH` clause.
    Register,
    /// Parameters arrive on the data stack, pushed by the caller.
    Stack,
}

/// A `.PROC` definition. Its body is assembled lazily (deferred) by the
/// pass manager the first time the procedure is called, not eagerly here.
#[derive(Debug, Clone)]
pub struct ProcDef {
    /// The procedure's declared name.
    pub name: String,
    /// Formal parameter names, in declaration order (empty for stack-ABI).
    pub params: Vec<String>,
    /// Calling convention, inferred from whether any parameters were
    /// declared.
    pub abi: ProcAbi,
    /// Whether `.PROC` carried the `EXPORTED` keyword.
    pub exported: bool,
    /// `.PREG NAME idx` aliases declared inside this procedure, binding a
    /// name to a `PR` pseudo-id (`PR_BASE + idx`) for the duration of the
    /// body.
    pub pregs: HashMap<String, u32>,
    /// The procedure's body, unexpanded.
    pub body: Vec<Line>,
}

/// Parse `.PROC name [EXPORTED] [WITH f1 f2 …]`'s trailer into
/// `(exported, params)`.
fn parse_proc_trailer(mut parts: std::str::SplitWhitespace) -> (bool, Vec<String>) {
    let mut exported = false;
    if let Some(tok) = parts.clone().next() {
        if tok == "EXPORTED" {
            exported = true;
            parts.next();
        }
    }
    let params = match parts.next() {
        Some("WITH") => parts.map(str::to_string).collect(),
        _ => Vec::new(),
    };
    (exported, params)
}

/// Every definition table extracted from one translation unit, plus the
/// residual lines that are neither inside a block nor a `.DEFINE`.
#[derive(Debug, Clone, Default)]
pub struct DefinitionTables {
    /// `.MACRO`/`.ROUTINE` definitions, keyed by name.
    pub callables: HashMap<String, CallableDef>,
    /// `.PROC` definitions, keyed by name.
    pub procs: HashMap<String, ProcDef>,
    /// `.DEFINE` textual substitutions, keyed by name.
    pub defines: HashMap<String, String>,
    /// `.REG NAME id` aliases, keyed by name, naming a `DR` slot by index.
    pub register_aliases: HashMap<String, u32>,
    /// Every line not inside a block directive and not a `.DEFINE`/`.REG`.
    pub residual: Vec<Line>,
}

enum BlockKind {
    Macro,
    Routine,
    Proc,
}

struct OpenBlock {
    kind: BlockKind,
    name: String,
    params: Vec<String>,
    exported: bool,
    pregs: HashMap<String, u32>,
    body: Vec<Line>,
}

/// Walk `lines`, building a [`DefinitionTables`]. Block directives
/// (`.MACRO`/`.ROUTINE`/`.PROC` ... `.END`) may not nest inside one
/// another; a `.DEFINE` is a single line, evaluated wherever it occurs.
pub fn extract(lines: &[Line]) -> AssemblyResult<DefinitionTables> {
    let mut tables = DefinitionTables::default();
    let mut open: Option<OpenBlock> = None;

    for line in lines {
        if line.is_blank() {
            continue;
        }
        let head = line.head().unwrap_or_default();
        match head {
            ".MACRO" | ".ROUTINE" | ".PROC" => {
                if open.is_some() {
                    return asm_err!(
                        line.location,
                        line.text.clone(),
                        Structural,
                        "{head} may not be nested inside another block directive"
                    );
                }
                let mut parts = line.rest().split_whitespace();
                let name = parts.next().ok_or_else(|| {
                    crate::error::AssemblyError::new(
                        line.location.clone(),
                        line.text.clone(),
                        crate::error::AssemblyErrorKind::Syntax(format!("{head} requires a name")),
                    )
                })?;
                let (exported, params) = if head == ".PROC" {
                    parse_proc_trailer(parts)
                } else {
                    (false, parts.map(|s| s.to_string()).collect())
                };
                let kind = match head {
                    ".MACRO" => BlockKind::Macro,
                    ".ROUTINE" => BlockKind::Routine,
                    _ => BlockKind::Proc,
                };
                open = Some(OpenBlock {
                    kind,
                    name: name.to_string(),
                    params,
                    exported,
                    pregs: HashMap::new(),
                    body: Vec::new(),
                });
            }
            ".ENDM" | ".ENDR" | ".ENDP" => {
                let block = open.take().ok_or_else(|| {
                    crate::error::AssemblyError::new(
                        line.location.clone(),
                        line.text.clone(),
                        crate::error::AssemblyErrorKind::Structural(format!("{head} with no open block directive")),
                    )
                })?;
                let expected = match block.kind {
                    BlockKind::Macro => ".ENDM",
                    BlockKind::Routine => ".ENDR",
                    BlockKind::Proc => ".ENDP",
                };
                if head != expected {
                    return asm_err!(
                        line.location,
                        line.text.clone(),
                        Structural,
                        "{head} does not match the open block's {expected} (started as {})",
                        block.name
                    );
                }
                match block.kind {
                    BlockKind::Macro | BlockKind::Routine => {
                        if tables.callables.contains_key(&block.name) {
                            return asm_err!(
                                line.location,
                                line.text.clone(),
                                Semantic,
                                "duplicate macro/routine definition {}",
                                block.name
                            );
                        }
                        tables.callables.insert(
                            block.name.clone(),
                            CallableDef {
                                name: block.name,
                                params: block.params,
                                body: block.body,
                            },
                        );
                    }
                    BlockKind::Proc => {
                        if tables.procs.contains_key(&block.name) {
                            return asm_err!(
                                line.location,
                                line.text.clone(),
                                Semantic,
                                "duplicate procedure definition {}",
                                block.name
                            );
                        }
                        let abi = if block.params.is_empty() {
                            ProcAbi::Stack
                        } else {
                            ProcAbi::Register
                        };
                        tables.procs.insert(
                            block.name.clone(),
                            ProcDef {
                                name: block.name,
                                params: block.params,
                                abi,
                                exported: block.exported,
                                pregs: block.pregs,
                                body: block.body,
                            },
                        );
                    }
                }
            }
            ".PREG" => {
                let block = match &mut open {
                    Some(b) if matches!(b.kind, BlockKind::Proc) => b,
                    _ => return asm_err!(line.location, line.text.clone(), Structural, ".PREG is only valid inside a .PROC body"),
                };
                let mut parts = line.rest().split_whitespace();
                let name = parts.next().unwrap_or_default().to_string();
                let idx: u32 = parts
                    .next()
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| {
                        crate::error::AssemblyError::new(
                            line.location.clone(),
                            line.text.clone(),
                            crate::error::AssemblyErrorKind::Syntax(".PREG requires a name and a numeric index".to_string()),
                        )
                    })?;
                if name.is_empty() {
                    return asm_err!(line.location, line.text.clone(), Syntax, ".PREG requires a name");
                }
                block.pregs.insert(name, idx);
            }
            ".REG" => {
                if open.is_some() {
                    return asm_err!(
                        line.location,
                        line.text.clone(),
                        Structural,
                        ".REG may not appear inside a block directive"
                    );
                }
                let mut parts = line.rest().split_whitespace();
                let name = parts.next().unwrap_or_default().to_string();
                let idx: u32 = parts.next().and_then(|s| s.parse().ok()).ok_or_else(|| {
                    crate::error::AssemblyError::new(
                        line.location.clone(),
                        line.text.clone(),
                        crate::error::AssemblyErrorKind::Syntax(".REG requires a name and a numeric register index".to_string()),
                    )
                })?;
                if name.is_empty() {
                    return asm_err!(line.location, line.text.clone(), Syntax, ".REG requires a name");
                }
                if tables.register_aliases.insert(name.clone(), idx).is_some() {
                    return asm_err!(line.location, line.text.clone(), Semantic, "duplicate .REG alias {}", name);
                }
            }
            ".DEFINE" => {
                if open.is_some() {
                    return asm_err!(
                        line.location,
                        line.text.clone(),
                        Structural,
                        ".DEFINE may not appear inside a block directive"
                    );
                }
                let mut parts = line.rest().splitn(2, char::is_whitespace);
                let name = parts.next().unwrap_or_default().to_string();
                let value = parts.next().unwrap_or_default().trim().to_string();
                if name.is_empty() {
                    return asm_err!(line.location, line.text.clone(), Syntax, ".DEFINE requires a name");
                }
                if tables.defines.insert(name.clone(), value).is_some() {
                    return asm_err!(
                        line.location,
                        line.text.clone(),
                        Semantic,
                        "duplicate .DEFINE {}",
                        name
                    );
                }
            }
            _ => match &mut open {
                Some(block) => block.body.push(line.clone()),
                None => tables.residual.push(line.clone()),
            },
        }
    }

    if let Some(block) = open {
        return asm_err!(
            lines.last().map(|l| l.location.clone()).unwrap_or_default(),
            String::new(),
            Structural,
            "unterminated block directive {}",
            block.name
        );
    }

    Ok(tables)
}
