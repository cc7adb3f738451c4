use super::scanner::{scan_hook_sites, HookClass, HookSite, KwValue, Literal};
use super::{
    IntegerBounds, OutputKind, PortSpec, PortType, RegistryError, WorkflowDefinition,
    WorkflowSourceFile,
};
use crate::shared::ids::{ArgumentName, CommandName};
use crate::value::ArgumentValue;
use std::collections::HashSet;

/// Turns a raw workflow source into a typed definition without executing it.
pub trait WorkflowCompiler: Send + Sync {
    fn compile(&self, source: &WorkflowSourceFile) -> Result<WorkflowDefinition, RegistryError>;
}

/// Discovers ports from the fixed hook call-sites of exported scripts.
#[derive(Debug, Clone, Copy, Default)]
pub struct HookScanCompiler;

impl WorkflowCompiler for HookScanCompiler {
    fn compile(&self, source: &WorkflowSourceFile) -> Result<WorkflowDefinition, RegistryError> {
        let workflow = source.name.as_str();
        let name = CommandName::parse(workflow)
            .map_err(|err| RegistryError::malformed(workflow, format!("invalid command name: {err}")))?;
        let sites = scan_hook_sites(&source.text)
            .map_err(|err| RegistryError::malformed(workflow, err.to_string()))?;

        let mut ports = Vec::new();
        let mut outputs = Vec::new();
        let mut seen = HashSet::new();
        for site in &sites {
            match site.class {
                HookClass::StringOutput => outputs.push(OutputKind::Text),
                HookClass::ImageOutput => outputs.push(OutputKind::Image),
                _ => {
                    let port = port_from_site(workflow, site)?;
                    if !seen.insert(port.argument_name.clone()) {
                        return Err(RegistryError::malformed(
                            workflow,
                            format!(
                                "argument `{}` is declared more than once (line {})",
                                port.argument_name, site.line
                            ),
                        ));
                    }
                    ports.push(port);
                }
            }
        }

        Ok(WorkflowDefinition {
            name,
            ports,
            outputs,
        })
    }
}

fn site_error(workflow: &str, site: &HookSite, reason: impl std::fmt::Display) -> RegistryError {
    RegistryError::malformed(
        workflow,
        format!(
            "{} `{}` at line {}: {reason}",
            site.class.class_name(),
            site.node_id,
            site.line
        ),
    )
}

fn literal_str(workflow: &str, site: &HookSite, key: &str) -> Result<Option<String>, RegistryError> {
    match site.kwarg(key) {
        None | Some(KwValue::Literal(Literal::None)) => Ok(None),
        Some(KwValue::Literal(Literal::Str(value))) => Ok(Some(value.clone())),
        Some(other) => Err(site_error(
            workflow,
            site,
            format!("`{key}` must be a string literal, found {other:?}"),
        )),
    }
}

fn literal_int(workflow: &str, site: &HookSite, key: &str) -> Result<Option<i64>, RegistryError> {
    match site.kwarg(key) {
        None | Some(KwValue::Literal(Literal::None)) => Ok(None),
        Some(KwValue::Literal(Literal::Int(value))) => Ok(Some(*value)),
        Some(other) => Err(site_error(
            workflow,
            site,
            format!("`{key}` must be an integer literal, found {other:?}"),
        )),
    }
}

fn literal_bool(
    workflow: &str,
    site: &HookSite,
    key: &str,
    default: bool,
) -> Result<bool, RegistryError> {
    match site.kwarg(key) {
        None => Ok(default),
        Some(KwValue::Literal(Literal::Bool(value))) => Ok(*value),
        Some(KwValue::Literal(Literal::Int(value))) => Ok(*value != 0),
        Some(other) => Err(site_error(
            workflow,
            site,
            format!("`{key}` must be True or False, found {other:?}"),
        )),
    }
}

fn port_from_site(workflow: &str, site: &HookSite) -> Result<PortSpec, RegistryError> {
    let raw_name = literal_str(workflow, site, "argument_name")?
        .ok_or_else(|| site_error(workflow, site, "hook has no `argument_name`"))?;
    let argument_name = ArgumentName::parse(raw_name.trim())
        .map_err(|err| site_error(workflow, site, err))?;

    let (port_type, default, bounds, required) = match site.class {
        HookClass::StringInput => {
            let default = literal_str(workflow, site, "string")?.map(ArgumentValue::Text);
            let required = literal_bool(workflow, site, "required", false)?;
            (PortType::String, default, None, required)
        }
        HookClass::IntegerInput => {
            let default = literal_int(workflow, site, "integer")?;
            let min = literal_int(workflow, site, "integer_min")?.unwrap_or(i64::MIN);
            let max = literal_int(workflow, site, "integer_max")?.unwrap_or(i64::MAX);
            if min > max {
                return Err(site_error(
                    workflow,
                    site,
                    format!("integer_min {min} is greater than integer_max {max}"),
                ));
            }
            let bounds = IntegerBounds { min, max };
            if let Some(value) = default.filter(|value| !bounds.contains(*value)) {
                return Err(site_error(
                    workflow,
                    site,
                    format!("default {value} is outside {min}..{max}"),
                ));
            }
            let required = literal_bool(workflow, site, "required", false)?;
            (
                PortType::Integer,
                default.map(ArgumentValue::Integer),
                Some(bounds),
                required,
            )
        }
        HookClass::ImageInput => {
            let required = literal_bool(workflow, site, "required", true)?;
            (PortType::Image, None, None, required)
        }
        HookClass::StringOutput | HookClass::ImageOutput => {
            return Err(site_error(workflow, site, "output hooks do not declare ports"));
        }
    };

    Ok(PortSpec {
        argument_name,
        port_type,
        required,
        default,
        bounds,
        node_id: site.node_id.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn source(name: &str, text: &str) -> WorkflowSourceFile {
        WorkflowSourceFile {
            name: name.to_string(),
            path: PathBuf::from(format!("/workflows/{name}.py")),
            text: text.to_string(),
        }
    }

    #[test]
    fn integer_bounds_default_to_full_range() {
        let def = HookScanCompiler
            .compile(&source(
                "steps",
                "n = NODE_CLASS_MAPPINGS[\"AppIO_IntegerInput\"]()\nn.execute(integer=30, argument_name=\"steps\")\n",
            ))
            .expect("compile");
        let bounds = def.ports[0].bounds.expect("bounds");
        assert_eq!((bounds.min, bounds.max), (i64::MIN, i64::MAX));
        assert_eq!(def.ports[0].default, Some(ArgumentValue::Integer(30)));
        assert!(!def.ports[0].required);
    }

    #[test]
    fn inverted_bounds_and_out_of_range_defaults_are_malformed() {
        let inverted = HookScanCompiler.compile(&source(
            "bad",
            "n = NODE_CLASS_MAPPINGS[\"AppIO_IntegerInput\"]()\nn.execute(integer_min=5, integer_max=1, argument_name=\"x\")\n",
        ));
        assert!(matches!(inverted, Err(RegistryError::MalformedWorkflow { .. })));

        let outside = HookScanCompiler.compile(&source(
            "bad",
            "n = NODE_CLASS_MAPPINGS[\"AppIO_IntegerInput\"]()\nn.execute(integer=9, integer_min=1, integer_max=4, argument_name=\"x\")\n",
        ));
        let err = outside.expect_err("out of range default");
        assert!(err.to_string().contains("outside 1..4"));
    }

    #[test]
    fn image_ports_are_required_unless_declared_optional() {
        let def = HookScanCompiler
            .compile(&source(
                "img",
                "a = NODE_CLASS_MAPPINGS[\"AppIO_ImageInput\"]()\na.execute(argument_name=\"image\")\n\
                 b = NODE_CLASS_MAPPINGS[\"AppIO_ImageInput\"]()\nb.execute(argument_name=\"mask\", required=False)\n",
            ))
            .expect("compile");
        assert!(def.ports[0].required);
        assert!(!def.ports[1].required);
    }

    #[test]
    fn non_literal_argument_name_is_malformed() {
        let err = HookScanCompiler
            .compile(&source(
                "expr",
                "s = NODE_CLASS_MAPPINGS[\"AppIO_StringInput\"]()\ns.execute(argument_name=names[0])\n",
            ))
            .expect_err("expression name");
        assert!(err.to_string().contains("must be a string literal"));
    }
}
