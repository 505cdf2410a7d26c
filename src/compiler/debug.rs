//! Debug dumps for the token stream and the Prim IR

use super::prim::PrimFunc;
use crate::error::{Error, Result};
use crate::lexer::Token;
use std::fmt::Write as _;

const RULE: &str = "═══════════════════════════════════════════════════════════";
const THIN: &str = "───────────────────────────────────────────────────────────";

/// Renders every token as one JSON object per line
pub fn dump_tokens(tokens: &[Token]) -> Result<String> {
    let mut out = String::new();
    for tok in tokens {
        let line = serde_json::to_string(tok).map_err(|e| Error::internal(e.to_string()))?;
        out.push_str(&line);
        out.push('\n');
    }
    Ok(out)
}

/// Renders the Prim listing of each function
pub fn dump_ir(funcs: &[PrimFunc]) -> String {
    let mut out = String::new();
    for func in funcs {
        let _ = writeln!(out, "{}", RULE);
        let _ = writeln!(
            out,
            "{}{}",
            func.label,
            if func.exported { " (global)" } else { "" }
        );
        let temps = func.slots.iter().filter(|s| s.temp).count();
        let _ = writeln!(
            out,
            "Slots: {} ({} temps), {} words",
            func.slots.len(),
            temps,
            func.slots.iter().map(|s| s.words).sum::<u32>()
        );
        let _ = writeln!(out, "{}", THIN);
        for (i, (_, prim)) in func.prims.iter().enumerate() {
            let _ = writeln!(out, "{:04}: {}", i, prim);
        }
    }
    if !funcs.is_empty() {
        let _ = writeln!(out, "{}", RULE);
    }
    out
}
