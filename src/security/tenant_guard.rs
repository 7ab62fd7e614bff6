//! Tenant Guard
//!
//! Mechanical tenant-isolation check run on every resolved query before it reaches the
//! datastore. The language model is told to scope queries to the caller's business, but
//! its output is never trusted. The query is parsed with `sqlparser` and executed only if
//!
//! * it is one read-only `SELECT` / `WITH` statement without `TABLE`, `INTO` or locking
//!   clauses, and calls no function that runs SQL text or touches the server,
//! * every base table read in any `SELECT` has its own top-level WHERE conjunct
//!   `<binding>.<tenant_column> = <business id>` (the bare column is enough when the
//!   SELECT reads a single relation), and
//! * at least one base table is read.
//!
//! Similarity predicates inserted by the resolver are replaced by `TRUE` before parsing.
//! They are generated text, and pgvector's `<->` is not PostgreSQL core syntax.

use crate::error::{PipelineError, Result};
use crate::query::{BusinessId, ResolvedQuery};
use sqlparser::ast::{
    visit_expressions, visit_relations, BinaryOperator, Cte, Expr, Ident, ObjectName, Query,
    Select, SetExpr, Statement, TableFactor, TableWithJoins, Value, Visit, Visitor,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use std::ops::ControlFlow;
use tracing::warn;

/// Functions that execute SQL passed as text, read server files, reach other servers or
/// change state.
const FORBIDDEN_FUNCTION_PREFIXES: &[&str] = &[
    "query_to_",
    "cursor_to_",
    "table_to_xml",
    "schema_to_xml",
    "database_to_xml",
    "dblink",
    "pg_read_",
    "pg_ls_",
    "pg_stat_file",
    "lo_",
    "pg_sleep",
    "set_config",
    "setval",
    "nextval",
    "pg_terminate_backend",
    "pg_cancel_backend",
];

pub struct TenantGuard {
    tenant_column: String,
}

/// A relation named in a FROM clause.
enum FromItem {
    /// Base table with the name its columns are qualified by.
    Table(String),
    Cte,
    Derived,
    Function,
}

/// Collects every query node, nested ones included.
#[derive(Default)]
struct QueryCollector {
    queries: Vec<Query>,
}

impl Visitor for QueryCollector {
    type Break = ();

    fn pre_visit_query(&mut self, query: &Query) -> ControlFlow<Self::Break> {
        self.queries.push(query.clone());
        ControlFlow::Continue(())
    }
}

impl TenantGuard {
    pub fn new(tenant_column: impl Into<String>) -> Self {
        Self {
            tenant_column: tenant_column.into(),
        }
    }

    pub fn tenant_column(&self) -> &str {
        &self.tenant_column
    }

    /// Reject the query unless it is read-only and scoped to `business_id`.
    pub fn check(&self, business_id: &BusinessId, query: &ResolvedQuery) -> Result<()> {
        let result = self.check_inner(business_id, query);
        if let Err(ref e) = result {
            warn!("Tenant guard rejected query for business {}: {}", business_id, e);
        }
        result
    }

    fn check_inner(&self, business_id: &BusinessId, query: &ResolvedQuery) -> Result<()> {
        let sql = guard_view(query)?;
        let dialect = PostgreSqlDialect {};
        let mut statements = Parser::parse_sql(&dialect, &sql)
            .map_err(|e| reject(format!("resolved query could not be parsed: {}", e)))?;
        if statements.len() != 1 {
            return Err(reject(format!(
                "expected exactly one statement, found {}",
                statements.len()
            )));
        }
        let statement = statements.remove(0);
        let Statement::Query(top) = &statement else {
            return Err(reject("only SELECT queries may run"));
        };

        ensure_no_forbidden_calls(&statement)?;

        let mut scope = Scope {
            guard: self,
            business_id,
            base_tables: 0,
        };

        let mut visible: Vec<String> = Vec::new();
        if let Some(with) = &top.with {
            if with.recursive {
                return Err(reject("WITH RECURSIVE is not allowed"));
            }
            for cte in &with.cte_tables {
                scope.check_scope_root(&cte.query, &visible)?;
                let name = cte_name(cte);
                if visible.contains(&name) {
                    return Err(reject(format!("common table expression `{}` is defined twice", name)));
                }
                visible.push(name);
            }
        }
        let mut main = top.as_ref().clone();
        main.with = None;
        scope.check_scope_root(&main, &visible)?;

        if scope.base_tables == 0 {
            return Err(reject(format!(
                "query has no `{} = '{}'` filter on any table",
                self.tenant_column, business_id
            )));
        }
        Ok(())
    }
}

/// Per-check state: the caller and a count of base-table reads seen so far.
struct Scope<'a> {
    guard: &'a TenantGuard,
    business_id: &'a BusinessId,
    base_tables: usize,
}

impl Scope<'_> {
    /// Check `root` and every query nested in it. `visible` lists the CTE names in scope.
    fn check_scope_root(&mut self, root: &Query, visible: &[String]) -> Result<()> {
        let mut collector = QueryCollector::default();
        let _ = root.visit(&mut collector);

        for query in &collector.queries {
            if query.with.is_some() {
                return Err(reject("WITH is only allowed at the start of the query"));
            }
            if !query.locks.is_empty() {
                return Err(reject("locking clauses are not allowed in a read-only query"));
            }
            self.check_body(&query.body, visible)?;
        }
        Ok(())
    }

    /// Nested `SetExpr::Query` bodies are collected as queries of their own.
    fn check_body(&mut self, body: &SetExpr, visible: &[String]) -> Result<()> {
        match body {
            SetExpr::Select(select) => self.check_select(select, visible),
            SetExpr::SetOperation { left, right, .. } => {
                self.check_body(left, visible)?;
                self.check_body(right, visible)
            }
            SetExpr::Query(_) | SetExpr::Values(_) => Ok(()),
            SetExpr::Table(_) => Err(reject("TABLE statements are not allowed")),
            _ => Err(reject("only SELECT queries may run")),
        }
    }

    fn check_select(&mut self, select: &Select, visible: &[String]) -> Result<()> {
        if select.into.is_some() {
            return Err(reject("SELECT INTO is not allowed"));
        }

        let mut items = Vec::new();
        for table in &select.from {
            collect_from_items(table, visible, &mut items)?;
        }

        let conjuncts = select.selection.as_ref().map(split_conjuncts).unwrap_or_default();
        let single_relation = items.len() == 1;
        for item in &items {
            let FromItem::Table(binding) = item else {
                continue;
            };
            let scoped = conjuncts
                .iter()
                .any(|conjunct| self.is_tenant_filter(conjunct, binding, single_relation));
            if !scoped {
                return Err(reject(format!(
                    "table `{}` is read without a top-level `{}.{} = '{}'` filter",
                    binding, binding, self.guard.tenant_column, self.business_id
                )));
            }
            self.base_tables += 1;
        }
        Ok(())
    }

    /// `column = value` or `value = column`, where `column` refers to `binding`.
    fn is_tenant_filter(&self, conjunct: &Expr, binding: &str, single_relation: bool) -> bool {
        let Expr::BinaryOp {
            left,
            op: BinaryOperator::Eq,
            right,
        } = conjunct
        else {
            return false;
        };
        let (left, right) = (peel(left), peel(right));
        (self.is_tenant_column(left, binding, single_relation) && is_business_value(right, self.business_id))
            || (is_business_value(left, self.business_id) && self.is_tenant_column(right, binding, single_relation))
    }

    fn is_tenant_column(&self, expr: &Expr, binding: &str, single_relation: bool) -> bool {
        match expr {
            Expr::Identifier(ident) => single_relation && self.names_tenant_column(ident),
            Expr::CompoundIdentifier(parts) if parts.len() >= 2 => {
                let qualifier = &parts[parts.len() - 2];
                self.names_tenant_column(&parts[parts.len() - 1])
                    && qualifier.value.eq_ignore_ascii_case(binding)
            }
            _ => false,
        }
    }

    fn names_tenant_column(&self, ident: &Ident) -> bool {
        ident.value.eq_ignore_ascii_case(&self.guard.tenant_column)
    }
}

/// The resolved SQL with every similarity predicate replaced by `TRUE`.
fn guard_view(query: &ResolvedQuery) -> Result<String> {
    let mut spans: Vec<_> = query.predicates.iter().map(|p| p.span.clone()).collect();
    spans.sort_by_key(|span| span.start);

    let mut view = String::with_capacity(query.sql.len());
    let mut copied_up_to = 0;
    for span in spans {
        let kept = span
            .start
            .checked_sub(copied_up_to)
            .and_then(|_| query.sql.get(copied_up_to..span.start))
            .filter(|_| query.sql.get(span.clone()).is_some())
            .ok_or_else(|| reject("similarity predicate does not match the resolved query"))?;
        view.push_str(kept);
        view.push_str("TRUE");
        copied_up_to = span.end;
    }
    let rest = query
        .sql
        .get(copied_up_to..)
        .ok_or_else(|| reject("similarity predicate does not match the resolved query"))?;
    view.push_str(rest);
    Ok(view)
}

fn ensure_no_forbidden_calls(statement: &Statement) -> Result<()> {
    let called = visit_expressions(statement, |expr| match expr {
        Expr::Function(function) if is_forbidden_function(&function.name) => {
            ControlFlow::Break(function.name.to_string())
        }
        _ => ControlFlow::Continue(()),
    });
    let from_item = visit_relations(statement, |name| {
        if is_forbidden_function(name) {
            ControlFlow::Break(name.to_string())
        } else {
            ControlFlow::Continue(())
        }
    });
    match (called, from_item) {
        (ControlFlow::Break(name), _) | (_, ControlFlow::Break(name)) => {
            Err(reject(format!("function `{}` is not allowed", name)))
        }
        _ => Ok(()),
    }
}

fn is_forbidden_function(name: &ObjectName) -> bool {
    let Some(last) = name.0.last() else {
        return false;
    };
    let lowered = last.value.to_ascii_lowercase();
    FORBIDDEN_FUNCTION_PREFIXES
        .iter()
        .any(|prefix| lowered.starts_with(prefix))
}

fn cte_name(cte: &Cte) -> String {
    normalize(&cte.alias.name)
}

/// Unquoted identifiers fold to lower case, quoted ones keep their spelling.
fn normalize(ident: &Ident) -> String {
    match ident.quote_style {
        Some(_) => ident.value.clone(),
        None => ident.value.to_ascii_lowercase(),
    }
}

fn collect_from_items(table: &TableWithJoins, visible: &[String], items: &mut Vec<FromItem>) -> Result<()> {
    collect_factor(&table.relation, visible, items)?;
    for join in &table.joins {
        collect_factor(&join.relation, visible, items)?;
    }
    Ok(())
}

fn collect_factor(factor: &TableFactor, visible: &[String], items: &mut Vec<FromItem>) -> Result<()> {
    match factor {
        TableFactor::Table { args: Some(_), .. } => items.push(FromItem::Function),
        TableFactor::Table { name, alias, .. } => {
            let is_cte = match name.0.as_slice() {
                [only] => visible.contains(&normalize(only)),
                _ => false,
            };
            if is_cte {
                items.push(FromItem::Cte);
            } else {
                let binding = alias
                    .as_ref()
                    .map(|alias| alias.name.value.clone())
                    .or_else(|| name.0.last().map(|ident| ident.value.clone()))
                    .ok_or_else(|| reject("table reference has no name"))?;
                items.push(FromItem::Table(binding));
            }
        }
        TableFactor::Derived { .. } => items.push(FromItem::Derived),
        TableFactor::NestedJoin { table_with_joins, .. } => {
            collect_from_items(table_with_joins, visible, items)?;
        }
        other => return Err(reject(format!("unsupported FROM item `{}`", other))),
    }
    Ok(())
}

/// Top-level AND conjuncts, looking through parentheses.
fn split_conjuncts(expr: &Expr) -> Vec<&Expr> {
    let mut out = Vec::new();
    let mut pending = vec![expr];
    while let Some(expr) = pending.pop() {
        match expr {
            Expr::BinaryOp {
                left,
                op: BinaryOperator::And,
                right,
            } => {
                pending.push(right);
                pending.push(left);
            }
            Expr::Nested(inner) => pending.push(inner),
            other => out.push(other),
        }
    }
    out
}

fn peel(mut expr: &Expr) -> &Expr {
    while let Expr::Nested(inner) = expr {
        expr = inner.as_ref();
    }
    expr
}

fn is_business_value(expr: &Expr, business_id: &BusinessId) -> bool {
    match expr {
        Expr::Value(Value::SingleQuotedString(text)) => text == business_id.as_str(),
        Expr::Value(Value::Number(number, _)) => number == business_id.as_str(),
        _ => false,
    }
}

fn reject(message: impl Into<String>) -> PipelineError {
    PipelineError::TenantIsolation(message.into())
}
