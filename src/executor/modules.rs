//! Module control commands
//!
//! `MODULE`, `LIBRARY`, `IMPORT`, `REMOVE` and `EXPORT` act on the calling
//! scope's module environment itself, so they are handled here rather than
//! registered as ordinary commands. A scope can never `REMOVE` them.

use super::{CommandResult, ExecError, Executor};
use crate::ast::{Position, Value};
use crate::module_env::{ImportSpec, ModuleError};
use crate::parser::parse_arguments;
use crate::state::ExecutionState;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

const MODULE_COMMANDS: &[&str] = &["MODULE", "LIBRARY", "IMPORT", "REMOVE", "EXPORT"];

/// Comma separated names inside one argument
fn names_in(value: &Value) -> Vec<String> {
    value
        .as_text()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

impl Executor {
    /// Names the executor handles itself rather than through the dispatch table
    pub fn module_command_names() -> &'static [&'static str] {
        MODULE_COMMANDS
    }

    pub(crate) fn is_module_command(name: &str) -> bool {
        MODULE_COMMANDS.contains(&name)
    }

    pub(crate) fn module_command(
        &self,
        name: &str,
        rest: &str,
        state: &Arc<ExecutionState>,
        position: Position,
    ) -> CommandResult {
        let (args, named) = match parse_arguments(rest) {
            Ok(parsed) => parsed,
            Err(e) => return self.fail(position, e),
        };
        let result = match name {
            "MODULE" => self.module_name(&args, state),
            "LIBRARY" => self.library(&args, state),
            "IMPORT" => self.import(&args, &named, state),
            "REMOVE" => self.remove(&args, state),
            "EXPORT" => self.export(&args, &named, state),
            _ => return self.fail(position, ExecError::UnknownCommand(name.to_string())),
        };
        match result {
            Ok(()) => CommandResult::Status(true),
            Err(ModuleCommandError::Usage(usage)) => {
                self.fail(position, ExecError::Argument(format!("usage: {}", usage)))
            }
            Err(ModuleCommandError::Module(e)) => self.fail(position, e),
        }
    }

    fn module_name(&self, args: &[Value], state: &ExecutionState) -> Result<(), ModuleCommandError> {
        let [name] = args else {
            return Err(ModuleCommandError::Usage("MODULE <name>"));
        };
        let name = name.as_text();
        debug!(target: "tether::system", "default module is now {}", name);
        state.env().set_default_name(&name);
        Ok(())
    }

    /// `LIBRARY "restrict spec, ..."` or `LIBRARY "allow spec, ..."`
    fn library(&self, args: &[Value], state: &ExecutionState) -> Result<(), ModuleCommandError> {
        if args.is_empty() {
            return Err(ModuleCommandError::Usage("LIBRARY \"restrict|allow <spec>\""));
        }
        for directive in args {
            let text = directive.as_text();
            let (verb, specs) = text.trim().split_once(char::is_whitespace).unwrap_or((text.trim(), ""));
            let specs: Vec<&str> = specs.split(',').map(str::trim).filter(|s| !s.is_empty()).collect();
            if specs.is_empty() {
                return Err(ModuleError::BadDirective(text.clone()).into());
            }
            for spec in specs {
                match verb {
                    "restrict" => state.env().restrict(spec)?,
                    "allow" => state.env().allow(spec)?,
                    _ => return Err(ModuleError::BadDirective(text.clone()).into()),
                }
            }
        }
        Ok(())
    }

    /// `IMPORT math`, `IMPORT "math::add", "math::sub"`, `IMPORT plus: "math::add"`
    fn import(
        &self,
        args: &[Value],
        named: &BTreeMap<String, Value>,
        state: &ExecutionState,
    ) -> Result<(), ModuleCommandError> {
        if args.is_empty() && named.is_empty() {
            return Err(ModuleCommandError::Usage("IMPORT <module> or IMPORT \"<module>::<item>\", ..."));
        }
        let specs = args
            .iter()
            .map(|v| ImportSpec::parse(&v.as_text(), None))
            .chain(named.iter().map(|(alias, v)| ImportSpec::parse(&v.as_text(), Some(alias.clone()))));
        for spec in specs {
            let bound = state.env().import(&spec)?;
            debug!(target: "tether::system", "IMPORT {}: bound {}", spec.module, bound.join(", "));
        }
        Ok(())
    }

    /// `REMOVE ALL`, `REMOVE MY "a, b"`, `REMOVE module`, `REMOVE "module::a, b"`
    fn remove(&self, args: &[Value], state: &ExecutionState) -> Result<(), ModuleCommandError> {
        let Some((first, rest)) = args.split_first() else {
            return Err(ModuleCommandError::Usage("REMOVE ALL|MY \"names\"|<module>|\"<module>::<items>\""));
        };
        let env = state.env();
        match first.as_text().as_str() {
            "ALL" => {
                env.remove_all();
                return Ok(());
            }
            "MY" => {
                let names: Vec<String> = rest.iter().flat_map(names_in).collect();
                env.remove_mine(&names)?;
                return Ok(());
            }
            _ => {}
        }
        for target in args {
            let text = target.as_text();
            match text.split_once("::") {
                Some((module, items)) => {
                    let items = names_in(&Value::quoted(items));
                    env.remove_items(module.trim(), &items)?;
                }
                None => {
                    let removed = env.remove_module(text.trim())?;
                    debug!(target: "tether::system", "REMOVE {}: {} name(s)", text, removed);
                }
            }
        }
        Ok(())
    }

    /// `EXPORT name, ...`, `EXPORT "module::spec"`, `EXPORT alias: name`
    fn export(
        &self,
        args: &[Value],
        named: &BTreeMap<String, Value>,
        state: &ExecutionState,
    ) -> Result<(), ModuleCommandError> {
        if args.is_empty() && named.is_empty() {
            return Err(ModuleCommandError::Usage("EXPORT <name>, ... or EXPORT \"<module>::<item>\""));
        }
        let env = state.env();
        let exports = args
            .iter()
            .map(|v| (v, None))
            .chain(named.iter().map(|(alias, v)| (v, Some(alias.as_str()))));
        for (value, alias) in exports {
            let text = value.as_text();
            if matches!(value, Value::Quoted(_)) && text.contains("::") {
                env.export_spec(&ImportSpec::parse(&text, alias.map(str::to_string)))?;
            } else {
                env.export_name(text.trim(), alias, |name| state.get_variable(name))?;
            }
        }
        Ok(())
    }
}

enum ModuleCommandError {
    Usage(&'static str),
    Module(ModuleError),
}

impl From<ModuleError> for ModuleCommandError {
    fn from(e: ModuleError) -> Self {
        ModuleCommandError::Module(e)
    }
}
