//! Subcommand: `convoflow validate`.

use std::path::Path;

use anyhow::{Result, bail};
use convoflow_engine::{FlowRegistry, validate};
use convoflow_expr::Evaluator;
use convoflow_tools::ToolRegistry;

use crate::helpers::{init_tracing, load_flows, load_tools};

/// Print every issue; fail when any of them is an error.
pub fn cmd_validate(flows: &Path, tools: Option<&Path>) -> Result<()> {
    init_tracing("warn");

    let flows = FlowRegistry::new(load_flows(flows)?)?;
    let tools = ToolRegistry::new(load_tools(tools)?)?;
    let report = validate(&flows, &tools, &Evaluator::default());

    for issue in &report.issues {
        println!("{issue}");
    }
    let errors = report.errors().count();
    let warnings = report.warnings().count();
    println!("{} flows, {} tools: {errors} errors, {warnings} warnings", flows.len(), tools.len());

    if errors > 0 {
        bail!("{errors} flow definition errors");
    }
    Ok(())
}
