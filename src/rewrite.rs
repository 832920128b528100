//! Query rewriting for worker execution.
//!
//! The initiator marks the `s3_cluster(...)` invocation it is coordinating by
//! overwriting its URL argument with its own identity hash. Workers executing
//! the rewritten text route that argument into identity resolution instead of
//! reading it as an object URL.

use std::hash::{Hash, Hasher};
use std::ops::ControlFlow;

use siphasher::sip::SipHasher13;
use sqlparser::ast::{
    Expr, FunctionArg, FunctionArgExpr, Statement, TableFactor, Value, Visit, VisitMut, Visitor,
    VisitorMut,
};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;

use crate::error::{ClusterError, Result};

/// Name under which the table function is registered.
pub const TABLE_FUNCTION_NAME: &str = "s3_cluster";

/// Positional index of the URL ("bucket") argument.
pub const URL_ARG: usize = 1;

/// Comparison key identifying one table-function invocation by shape.
///
/// Computed once from the function name and its literal arguments, before
/// any rewriting, so later mutation of the tree cannot make a second node
/// match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TableFunctionKey(u64);

impl TableFunctionKey {
    pub fn new(function_name: &str, args: &[String]) -> Self {
        let mut hasher = SipHasher13::new();
        function_name.to_lowercase().hash(&mut hasher);
        args.hash(&mut hasher);
        Self(hasher.finish())
    }

    /// Key of a table factor, or `None` when it is not a table-function call
    /// with only string-literal arguments.
    pub fn of_table_factor(factor: &TableFactor) -> Option<Self> {
        let TableFactor::Table {
            name,
            args: Some(args),
            ..
        } = factor
        else {
            return None;
        };

        let function_name = name.0.last()?.value.clone();
        let literals = args
            .args
            .iter()
            .map(|arg| match arg {
                FunctionArg::Unnamed(FunctionArgExpr::Expr(Expr::Value(
                    Value::SingleQuotedString(s),
                ))) => Some(s.clone()),
                _ => None,
            })
            .collect::<Option<Vec<String>>>()?;

        Some(Self::new(&function_name, &literals))
    }
}

/// Parse exactly one SQL statement.
pub fn parse_statement(sql: &str) -> Result<Statement> {
    let dialect = GenericDialect {};
    let mut statements = Parser::parse_sql(&dialect, sql)
        .map_err(|e| ClusterError::Rewrite(format!("parse error: {e}")))?;

    if statements.len() != 1 {
        return Err(ClusterError::Rewrite(format!(
            "expected a single statement, found {}",
            statements.len()
        )));
    }
    Ok(statements.remove(0))
}

struct InvocationFinder {
    target: TableFunctionKey,
    found: Option<TableFactor>,
}

impl Visitor for InvocationFinder {
    type Break = ();

    fn pre_visit_table_factor(&mut self, factor: &TableFactor) -> ControlFlow<Self::Break> {
        if TableFunctionKey::of_table_factor(factor) == Some(self.target) {
            let mut matched = factor.clone();
            if let TableFactor::Table { alias, .. } = &mut matched {
                *alias = None;
            }
            self.found = Some(matched);
            return ControlFlow::Break(());
        }
        ControlFlow::Continue(())
    }
}

struct UrlRewriter<'a> {
    target: TableFunctionKey,
    self_hash: &'a str,
    rewritten: bool,
}

impl VisitorMut for UrlRewriter<'_> {
    type Break = ();

    fn pre_visit_table_factor(&mut self, factor: &mut TableFactor) -> ControlFlow<Self::Break> {
        if TableFunctionKey::of_table_factor(factor) != Some(self.target) {
            return ControlFlow::Continue(());
        }

        if let TableFactor::Table { args: Some(args), .. } = factor {
            if let Some(FunctionArg::Unnamed(FunctionArgExpr::Expr(expr))) =
                args.args.get_mut(URL_ARG)
            {
                *expr = Expr::Value(Value::SingleQuotedString(self.self_hash.to_string()));
                self.rewritten = true;
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }
}

/// Return the invocation matching `target`, with its alias stripped.
pub fn find_table_function(query: &Statement, target: TableFunctionKey) -> Result<TableFactor> {
    let mut finder = InvocationFinder {
        target,
        found: None,
    };
    let _ = Visit::visit(query, &mut finder);
    finder.found.ok_or_else(|| {
        ClusterError::Rewrite(format!(
            "no {TABLE_FUNCTION_NAME} invocation in the query matches the planned table function"
        ))
    })
}

/// Replace the URL argument of the invocation matching `target` with
/// `self_hash` and render the resulting query text.
///
/// Only the first matching invocation is rewritten. Finding none means the
/// query shape changed between planning and execution, and the query cannot
/// be distributed.
pub fn rewrite_for_workers(
    query: &Statement,
    target: TableFunctionKey,
    self_hash: &str,
) -> Result<String> {
    let mut rewritten = query.clone();
    let mut rewriter = UrlRewriter {
        target,
        self_hash,
        rewritten: false,
    };
    let _ = VisitMut::visit(&mut rewritten, &mut rewriter);

    if !rewriter.rewritten {
        return Err(ClusterError::Rewrite(format!(
            "no {TABLE_FUNCTION_NAME} invocation was rewritten; the query shape diverged from the planned table function"
        )));
    }
    Ok(rewritten.to_string())
}

/// Double-quote an identifier for the worker query.
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Build the query every worker runs: a scan of the matched invocation with
/// the projected columns, its URL argument replaced by `self_hash`.
///
/// An empty column list selects `1 AS _row` so workers still report row
/// counts (e.g. for `COUNT(*)`).
pub fn worker_scan_query(
    query: &Statement,
    target: TableFunctionKey,
    columns: &[String],
    self_hash: &str,
) -> Result<String> {
    let invocation = find_table_function(query, target)?;

    let select_list = if columns.is_empty() {
        "1 AS _row".to_string()
    } else {
        columns
            .iter()
            .map(|c| quote_identifier(c))
            .collect::<Vec<_>>()
            .join(", ")
    };

    let scan = parse_statement(&format!("SELECT {select_list} FROM {invocation}"))?;
    rewrite_for_workers(&scan, target, self_hash)
}
