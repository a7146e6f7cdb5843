//! Identifier binding against the schema catalog.
//!
//! Walks every expression position of an admitted SELECT, resolves each
//! table and column reference case-insensitively, and rewrites the AST in
//! place with catalog casing. Any reference that does not resolve is an
//! error; the binder never guesses.

use sqlparser::ast::{
    BinaryOperator, Expr, Function, FunctionArg, FunctionArgExpr, FunctionArguments, GroupByExpr,
    Ident, Join, JoinConstraint, JoinOperator, ObjectName, OrderBy, Select, SelectItem,
    TableFactor,
};

use askdb_schema::{SchemaCatalog, TableDef};

use crate::ValidateError;

/// Scalar and aggregate functions the subset admits. String-concatenation
/// helpers are deliberately absent to stay consistent with the guardrail
/// pre-screen, which blocks concatenation markers outright.
const FUNCTION_ALLOW_LIST: &[&str] = &[
    "count", "sum", "avg", "min", "max", "abs", "round", "floor", "ceil", "ceiling", "coalesce",
    "nullif", "lower", "upper", "trim", "length", "substr", "substring", "year", "month", "day",
    "date_trunc", "date_part", "strftime", "current_date", "now",
];

struct Binding<'a> {
    /// Reference key as it appears in the query: the alias if one was given,
    /// otherwise the table name.
    key: String,
    table: &'a TableDef,
}

pub(crate) struct Scope<'a> {
    catalog: &'a SchemaCatalog,
    bindings: Vec<Binding<'a>>,
    /// Output-column aliases from the projection, resolvable in GROUP BY,
    /// HAVING and ORDER BY.
    aliases: Vec<String>,
}

/// Bind a SELECT (and its query-level ORDER BY) against the catalog.
/// Returns the catalog-cased names of the tables read, in FROM order.
pub(crate) fn bind_select(
    select: &mut Select,
    order_by: Option<&mut OrderBy>,
    catalog: &SchemaCatalog,
) -> Result<Vec<String>, ValidateError> {
    let mut scope = Scope {
        catalog,
        bindings: Vec::new(),
        aliases: Vec::new(),
    };

    if select.from.is_empty() {
        return Err(ValidateError::DisallowedConstruct(
            "SELECT without FROM".into(),
        ));
    }
    for table_with_joins in &mut select.from {
        scope.bind_table_factor(&mut table_with_joins.relation)?;
        for join in &mut table_with_joins.joins {
            scope.bind_join(join)?;
        }
    }

    // Projection first, collecting output aliases for the later clauses.
    // Bare names inside the projection itself resolve against tables only.
    let mut aliases = Vec::new();
    for item in &mut select.projection {
        match item {
            SelectItem::UnnamedExpr(expr) => scope.walk_expr(expr, false)?,
            SelectItem::ExprWithAlias { expr, alias } => {
                scope.walk_expr(expr, false)?;
                aliases.push(alias.value.clone());
            }
            SelectItem::Wildcard(_) => {}
            SelectItem::QualifiedWildcard(name, _) => {
                scope.canonicalize_qualifier(name)?;
            }
        }
    }
    scope.aliases = aliases;

    if let Some(selection) = &mut select.selection {
        scope.walk_expr(selection, false)?;
    }

    match &mut select.group_by {
        GroupByExpr::Expressions(exprs, modifiers) => {
            if !modifiers.is_empty() {
                return Err(ValidateError::DisallowedConstruct(
                    "GROUP BY modifier".into(),
                ));
            }
            for expr in exprs {
                scope.walk_expr(expr, true)?;
            }
        }
        GroupByExpr::All(_) => {
            return Err(ValidateError::DisallowedConstruct("GROUP BY ALL".into()));
        }
    }

    if let Some(having) = &mut select.having {
        scope.walk_expr(having, true)?;
    }

    if let Some(order_by) = order_by {
        for order_expr in &mut order_by.exprs {
            scope.walk_expr(&mut order_expr.expr, true)?;
        }
        if order_by.interpolate.is_some() {
            return Err(ValidateError::DisallowedConstruct("INTERPOLATE".into()));
        }
    }

    Ok(scope
        .bindings
        .iter()
        .map(|b| b.table.name.clone())
        .collect())
}

impl<'a> Scope<'a> {
    fn bind_table_factor(&mut self, relation: &mut TableFactor) -> Result<(), ValidateError> {
        match relation {
            TableFactor::Table {
                name,
                alias,
                args,
                with_hints,
                ..
            } => {
                if args.is_some() {
                    return Err(ValidateError::DisallowedConstruct(format!(
                        "table function {name}"
                    )));
                }
                if !with_hints.is_empty() {
                    return Err(ValidateError::DisallowedConstruct("table hints".into()));
                }

                if name.0.len() != 1 {
                    return Err(ValidateError::UnknownIdentifier(name.to_string()));
                }
                let ident = &mut name.0[0];
                let table = self
                    .catalog
                    .table(&ident.value)
                    .ok_or_else(|| ValidateError::UnknownIdentifier(ident.value.clone()))?;
                ident.value = table.name.clone();

                let key = match alias {
                    Some(table_alias) => {
                        if !table_alias.columns.is_empty() {
                            return Err(ValidateError::DisallowedConstruct(
                                "column alias list".into(),
                            ));
                        }
                        table_alias.name.value.clone()
                    }
                    None => table.name.clone(),
                };
                self.bindings.push(Binding { key, table });
                Ok(())
            }
            TableFactor::Derived { .. } => Err(ValidateError::DisallowedConstruct(
                "derived table (subquery in FROM)".into(),
            )),
            _ => Err(ValidateError::DisallowedConstruct(
                "unsupported FROM relation".into(),
            )),
        }
    }

    fn bind_join(&mut self, join: &mut Join) -> Result<(), ValidateError> {
        self.bind_table_factor(&mut join.relation)?;
        let constraint = match &mut join.join_operator {
            JoinOperator::Inner(constraint)
            | JoinOperator::LeftOuter(constraint)
            | JoinOperator::RightOuter(constraint)
            | JoinOperator::FullOuter(constraint) => constraint,
            JoinOperator::CrossJoin => return Ok(()),
            _ => {
                return Err(ValidateError::DisallowedConstruct(
                    "unsupported join type".into(),
                ));
            }
        };
        match constraint {
            JoinConstraint::On(expr) => self.walk_expr(expr, false),
            JoinConstraint::Using(columns) => {
                for ident in columns {
                    self.canonicalize_shared_column(ident)?;
                }
                Ok(())
            }
            JoinConstraint::Natural => Ok(()),
            JoinConstraint::None => Ok(()),
        }
    }

    /// Resolve a bare column against all bound tables. Exactly one table may
    /// own it; zero resolves nothing, two or more is ambiguous. Output
    /// aliases are consulted only where SQL allows them.
    fn resolve_bare(&self, ident: &mut Ident, allow_aliases: bool) -> Result<(), ValidateError> {
        let mut matches = Vec::new();
        for binding in &self.bindings {
            if let Some(column) = binding.table.column(&ident.value) {
                matches.push(column.name.clone());
            }
        }
        match matches.len() {
            1 => {
                ident.value = matches.remove(0);
                Ok(())
            }
            0 => {
                if allow_aliases {
                    if let Some(alias) = self
                        .aliases
                        .iter()
                        .find(|a| a.eq_ignore_ascii_case(&ident.value))
                    {
                        ident.value = alias.clone();
                        return Ok(());
                    }
                }
                Err(ValidateError::UnknownIdentifier(ident.value.clone()))
            }
            _ => Err(ValidateError::UnknownIdentifier(format!(
                "{} (ambiguous across joined tables)",
                ident.value
            ))),
        }
    }

    /// Resolve `qualifier.column`, canonicalizing both parts.
    fn resolve_qualified(&self, idents: &mut [Ident]) -> Result<(), ValidateError> {
        let [qualifier, column] = idents else {
            return Err(ValidateError::UnknownIdentifier(
                idents
                    .iter()
                    .map(|i| i.value.as_str())
                    .collect::<Vec<_>>()
                    .join("."),
            ));
        };
        let binding = self
            .bindings
            .iter()
            .find(|b| b.key.eq_ignore_ascii_case(&qualifier.value))
            .ok_or_else(|| ValidateError::UnknownIdentifier(qualifier.value.clone()))?;
        let def = binding
            .table
            .column(&column.value)
            .ok_or_else(|| {
                ValidateError::UnknownIdentifier(format!("{}.{}", qualifier.value, column.value))
            })?;
        qualifier.value = binding.key.clone();
        column.value = def.name.clone();
        Ok(())
    }

    /// USING-column: must exist in at least one bound table; shared-name
    /// ambiguity is the point of USING, so multiple owners are fine.
    fn canonicalize_shared_column(&self, ident: &mut Ident) -> Result<(), ValidateError> {
        for binding in &self.bindings {
            if let Some(column) = binding.table.column(&ident.value) {
                ident.value = column.name.clone();
                return Ok(());
            }
        }
        Err(ValidateError::UnknownIdentifier(ident.value.clone()))
    }

    fn canonicalize_qualifier(&self, name: &mut ObjectName) -> Result<(), ValidateError> {
        if name.0.len() != 1 {
            return Err(ValidateError::UnknownIdentifier(name.to_string()));
        }
        let ident = &mut name.0[0];
        let binding = self
            .bindings
            .iter()
            .find(|b| b.key.eq_ignore_ascii_case(&ident.value))
            .ok_or_else(|| ValidateError::UnknownIdentifier(ident.value.clone()))?;
        ident.value = binding.key.clone();
        Ok(())
    }

    fn walk_function(&self, func: &mut Function, allow_aliases: bool) -> Result<(), ValidateError> {
        if func.name.0.len() != 1 {
            return Err(ValidateError::DisallowedConstruct(format!(
                "function {}",
                func.name
            )));
        }
        let fname = func.name.0[0].value.to_ascii_lowercase();
        if !FUNCTION_ALLOW_LIST.contains(&fname.as_str()) {
            return Err(ValidateError::DisallowedConstruct(format!(
                "function {fname}"
            )));
        }
        func.name.0[0].value = fname;

        if func.over.is_some() {
            return Err(ValidateError::DisallowedConstruct("window function".into()));
        }
        if func.filter.is_some() || !func.within_group.is_empty() {
            return Err(ValidateError::DisallowedConstruct(
                "function modifier".into(),
            ));
        }

        match &mut func.args {
            FunctionArguments::None => Ok(()),
            FunctionArguments::Subquery(_) => {
                Err(ValidateError::DisallowedConstruct("subquery argument".into()))
            }
            FunctionArguments::List(list) => {
                if !list.clauses.is_empty() {
                    return Err(ValidateError::DisallowedConstruct(
                        "function argument clause".into(),
                    ));
                }
                for arg in &mut list.args {
                    match arg {
                        FunctionArg::Unnamed(FunctionArgExpr::Expr(expr)) => {
                            self.walk_expr(expr, allow_aliases)?;
                        }
                        FunctionArg::Unnamed(FunctionArgExpr::Wildcard) => {}
                        FunctionArg::Unnamed(FunctionArgExpr::QualifiedWildcard(name)) => {
                            self.canonicalize_qualifier(name)?;
                        }
                        _ => {
                            return Err(ValidateError::DisallowedConstruct(
                                "named function argument".into(),
                            ));
                        }
                    }
                }
                Ok(())
            }
        }
    }

    fn walk_expr(&self, expr: &mut Expr, allow_aliases: bool) -> Result<(), ValidateError> {
        match expr {
            Expr::Identifier(ident) => self.resolve_bare(ident, allow_aliases),
            Expr::CompoundIdentifier(idents) => self.resolve_qualified(idents),
            Expr::BinaryOp { left, op, right } => {
                check_binary_operator(op)?;
                self.walk_expr(left, allow_aliases)?;
                self.walk_expr(right, allow_aliases)
            }
            Expr::UnaryOp { expr, .. } => self.walk_expr(expr, allow_aliases),
            Expr::Nested(inner) => self.walk_expr(inner, allow_aliases),
            Expr::Value(_) => Ok(()),
            Expr::TypedString { .. } => Ok(()),
            Expr::Function(func) => self.walk_function(func, allow_aliases),
            Expr::IsNull(inner)
            | Expr::IsNotNull(inner)
            | Expr::IsTrue(inner)
            | Expr::IsNotTrue(inner)
            | Expr::IsFalse(inner)
            | Expr::IsNotFalse(inner) => self.walk_expr(inner, allow_aliases),
            Expr::Between {
                expr, low, high, ..
            } => {
                self.walk_expr(expr, allow_aliases)?;
                self.walk_expr(low, allow_aliases)?;
                self.walk_expr(high, allow_aliases)
            }
            Expr::InList { expr, list, .. } => {
                self.walk_expr(expr, allow_aliases)?;
                for item in list {
                    self.walk_expr(item, allow_aliases)?;
                }
                Ok(())
            }
            Expr::Like { expr, pattern, .. } | Expr::ILike { expr, pattern, .. } => {
                self.walk_expr(expr, allow_aliases)?;
                self.walk_expr(pattern, allow_aliases)
            }
            Expr::Cast { expr, .. } => self.walk_expr(expr, allow_aliases),
            Expr::Extract { expr, .. } => self.walk_expr(expr, allow_aliases),
            Expr::Case {
                operand,
                conditions,
                results,
                else_result,
            } => {
                if let Some(operand) = operand {
                    self.walk_expr(operand, allow_aliases)?;
                }
                for condition in conditions {
                    self.walk_expr(condition, allow_aliases)?;
                }
                for result in results {
                    self.walk_expr(result, allow_aliases)?;
                }
                if let Some(else_result) = else_result {
                    self.walk_expr(else_result, allow_aliases)?;
                }
                Ok(())
            }
            Expr::Tuple(items) => {
                for item in items {
                    self.walk_expr(item, allow_aliases)?;
                }
                Ok(())
            }
            Expr::Subquery(_) | Expr::InSubquery { .. } | Expr::Exists { .. } => Err(
                ValidateError::DisallowedConstruct("subquery".into()),
            ),
            other => Err(ValidateError::DisallowedConstruct(format!(
                "expression {other}"
            ))),
        }
    }
}

/// Arithmetic, comparison and logical operators only. Everything else,
/// string concatenation included, is outside the subset.
fn check_binary_operator(op: &BinaryOperator) -> Result<(), ValidateError> {
    use BinaryOperator::*;
    match op {
        Plus | Minus | Multiply | Divide | Modulo | Gt | Lt | GtEq | LtEq | Eq | NotEq | And
        | Or => Ok(()),
        other => Err(ValidateError::DisallowedConstruct(format!(
            "operator {other}"
        ))),
    }
}
