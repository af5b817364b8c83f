use std::collections::BTreeSet;

use super::{FRAME_FIELDS, RuleId, Severity, ValidationFinding, WITHHELD_PRIMITIVES, is_dunder};
use crate::lang::Span;
use crate::lang::ast::{
    Expr, ExprKind, Program, Stmt, StmtKind, Visitor, walk_expr, walk_program, walk_stmt,
};

/// Walk the tree the runtime will execute.
pub(super) fn inspect(
    program: &Program,
    allowed: &BTreeSet<&str>,
    entry_point: &str,
) -> Vec<ValidationFinding> {
    let mut inspector = Inspector {
        allowed,
        findings: Vec::new(),
    };
    walk_program(&mut inspector, program);

    if !program.functions().any(|f| f.name == entry_point) {
        inspector.findings.push(ValidationFinding::new(
            RuleId::MissingEntryPoint,
            Span::new(1, 1),
            Severity::High,
            format!("no top-level function named '{entry_point}'"),
        ));
    }
    inspector.findings
}

struct Inspector<'a> {
    allowed: &'a BTreeSet<&'a str>,
    findings: Vec<ValidationFinding>,
}

impl Inspector<'_> {
    fn forbidden_attribute(&mut self, name: &str, span: Span) {
        if name.starts_with('_') || FRAME_FIELDS.contains(&name) {
            self.findings.push(ValidationFinding::new(
                RuleId::ForbiddenAttribute,
                span,
                Severity::Critical,
                format!("access to attribute '{name}'"),
            ));
        }
    }

    /// Any mention of a withheld primitive, whether read or bound
    fn withheld(&mut self, name: &str, span: Span) {
        if WITHHELD_PRIMITIVES.contains(&name) || is_dunder(name) {
            self.findings.push(ValidationFinding::new(
                RuleId::WithheldPrimitive,
                span,
                Severity::Critical,
                format!("reference to withheld name '{name}'"),
            ));
        }
    }

    fn module(&mut self, module: &str, span: Span) {
        if !self.allowed.contains(module) {
            self.findings.push(ValidationFinding::new(
                RuleId::ModuleNotAllowed,
                span,
                Severity::High,
                format!("module '{module}' is not allowed"),
            ));
        }
    }
}

impl Visitor for Inspector<'_> {
    fn visit_stmt(&mut self, stmt: &Stmt) {
        match &stmt.kind {
            StmtKind::Import(aliases) => {
                for alias in aliases {
                    self.module(&alias.name, alias.span);
                    if let Some(asname) = &alias.asname {
                        self.withheld(asname, alias.span);
                    }
                }
            }
            StmtKind::ImportFrom { module, names } => {
                self.module(module, stmt.span);
                for alias in names {
                    if alias.name == "*" {
                        self.findings.push(ValidationFinding::new(
                            RuleId::StarImport,
                            alias.span,
                            Severity::High,
                            format!("'from {module} import *' is not allowed"),
                        ));
                        continue;
                    }
                    self.forbidden_attribute(&alias.name, alias.span);
                    self.withheld(alias.bound_name(), alias.span);
                }
            }
            StmtKind::FunctionDef(def) => {
                self.withheld(&def.name, def.span);
                for param in &def.params {
                    self.withheld(&param.name, param.span);
                }
            }
            StmtKind::Try { handlers, .. } => {
                for handler in handlers {
                    if let Some(name) = &handler.name {
                        self.withheld(name, handler.span);
                    }
                }
            }
            _ => {}
        }
        walk_stmt(self, stmt);
    }

    fn visit_expr(&mut self, expr: &Expr) {
        match &expr.kind {
            ExprKind::Name(name) => self.withheld(name, expr.span),
            ExprKind::Attribute { attr, .. } => self.forbidden_attribute(attr, expr.span),
            _ => {}
        }
        walk_expr(self, expr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lang::parse;

    fn inspect_source(source: &str) -> Vec<RuleId> {
        let program = parse(source).unwrap();
        let allowed = BTreeSet::from(["json", "math"]);
        inspect(&program, &allowed, "main")
            .into_iter()
            .map(|f| f.rule)
            .collect()
    }

    #[test]
    fn string_literals_are_not_attribute_access() {
        assert!(inspect_source("def main():\n    return '__class__' + '.__bases__'\n").is_empty());
    }

    #[test]
    fn attribute_writes_are_checked() {
        let rules = inspect_source("def main(x):\n    x._hidden = 1\n");
        assert_eq!(rules, vec![RuleId::ForbiddenAttribute]);
    }

    #[test]
    fn rebinding_withheld_names() {
        let rules = inspect_source("import math as eval\n\ndef main():\n    return 1\n");
        assert_eq!(rules, vec![RuleId::WithheldPrimitive]);
        let rules = inspect_source(
            "def main():\n    try:\n        pass\n    except Exception as type:\n        pass\n",
        );
        assert_eq!(rules, vec![RuleId::WithheldPrimitive]);
    }

    #[test]
    fn withheld_names_as_arguments() {
        let rules = inspect_source("def main():\n    return sorted([1], key=dir)\n");
        assert_eq!(rules, vec![RuleId::WithheldPrimitive]);
    }

    #[test]
    fn star_import() {
        let rules = inspect_source("from json import *\n\ndef main():\n    return 1\n");
        assert_eq!(rules, vec![RuleId::StarImport]);
    }

    #[test]
    fn frame_fields_are_forbidden_attributes() {
        let rules = inspect_source("def main(e):\n    return e.tb_frame\n");
        assert_eq!(rules, vec![RuleId::ForbiddenAttribute]);
    }

    #[test]
    fn nested_definitions_do_not_count_as_entry_points() {
        let source = "def outer():\n    def main():\n        return 1\n    return main\n";
        let rules = inspect_source(source);
        assert_eq!(rules, vec![RuleId::MissingEntryPoint]);
    }
}
