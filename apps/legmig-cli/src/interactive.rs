//! Prompt-driven session: choose a migrator, then apply actions to it until
//! `exit` or end of input.

use anyhow::{bail, Result};
use legmig_core::actions::render_stats;
use legmig_core::{ActionReport, MigratorAction, Operator};
use std::io::{BufRead, Write};

fn prompt<R: BufRead, W: Write>(input: &mut R, out: &mut W, label: &str) -> Result<Option<String>> {
    write!(out, "{label}")?;
    out.flush()?;
    let mut line = String::new();
    if input.read_line(&mut line)? == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim().to_string()))
}

/// Resolve the operator's pick: blank means the last run migrator, a number
/// is a 1-based position in the listing, anything else is a name.
fn pick(op: &Operator, names: &[String], answer: &str) -> Result<String> {
    if answer.is_empty() {
        return match op.last_run()? {
            Some(name) => Ok(name),
            None => bail!("no migrator has run yet; pick one"),
        };
    }
    if let Ok(n) = answer.parse::<usize>() {
        return match n.checked_sub(1).and_then(|i| names.get(i)) {
            Some(name) => Ok(name.clone()),
            None => bail!("no migrator at position {n}"),
        };
    }
    Ok(answer.to_string())
}

pub fn session<R: BufRead, W: Write>(op: &Operator, input: &mut R, out: &mut W) -> Result<()> {
    let names: Vec<String> = op.ordered().iter().map(|m| m.name().to_string()).collect();
    if names.is_empty() {
        writeln!(out, "no migrators registered")?;
        return Ok(());
    }
    for (i, name) in names.iter().enumerate() {
        writeln!(out, "  {}) {name}", i + 1)?;
    }
    let last = op.last_run()?.unwrap_or_default();
    let Some(answer) = prompt(input, out, &format!("migrator [{last}]: "))? else {
        return Ok(());
    };
    let name = pick(op, &names, &answer)?;
    op.registry().require(&name)?;
    op.remember(&name)?;

    let menu = MigratorAction::ALL
        .iter()
        .map(|a| a.as_str())
        .collect::<Vec<_>>()
        .join(", ");
    loop {
        writeln!(out, "actions: {menu}")?;
        let Some(answer) = prompt(input, out, &format!("{name}> "))? else {
            return Ok(());
        };
        let action = match answer.parse::<MigratorAction>() {
            Ok(action) => action,
            Err(err) => {
                writeln!(out, "{err}")?;
                continue;
            }
        };
        if action == MigratorAction::Exit {
            writeln!(out, "{}", ActionReport::Exit)?;
            return Ok(());
        }
        let report = op.apply(action, &name, |stats| {
            let _ = writeln!(out, "{}", render_stats(&name, stats));
        });
        match report {
            Ok(report) => writeln!(out, "{report}")?,
            Err(err) => writeln!(out, "error: {err:#}")?,
        }
    }
}
