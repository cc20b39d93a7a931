//! Logical query object model.
//!
//! This is the shape the (external) SQL parser hands to the planner and the
//! shape the SQL generator turns back into text. The planner treats a
//! `SelectQuery` as a value: it clones it, rewrites the clone, and never
//! mutates a query it is still iterating over.
//!
//! Placeholders (`FromItem::Placeholder`) are the only planner-specific
//! construct: they stand in for the materialized result of another node.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::id::NodeId;

/// Aggregate functions the model recognizes (lower-case).
pub const AGGREGATE_FUNCTIONS: &[&str] = &[
    "sum", "count", "avg", "min", "max", "stddev", "stddev_samp", "variance", "var_samp",
    "median",
];

pub fn is_aggregate_function(name: &str) -> bool {
    AGGREGATE_FUNCTIONS
        .iter()
        .any(|f| f.eq_ignore_ascii_case(name))
}

/// Fully-qualified table name (`schema.table`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableName {
    pub schema: String,
    pub table: String,
}

impl TableName {
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
        }
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.table)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaseTable {
    pub schema: String,
    pub table: String,
    #[serde(default)]
    pub alias: Option<String>,
}

impl BaseTable {
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
            alias: None,
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn name(&self) -> TableName {
        TableName::new(self.schema.clone(), self.table.clone())
    }

    /// The name column references use for this table: its alias, else its bare name.
    pub fn reference_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.table)
    }
}

/// Stand-in for the not-yet-materialized result of node `node`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaceholderRef {
    pub node: NodeId,
    pub table: TableName,
    pub alias: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinKind {
    Inner,
    Left,
    Right,
    Full,
    Cross,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinTable {
    pub left: FromItem,
    pub right: FromItem,
    pub kind: JoinKind,
    #[serde(default)]
    pub on: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FromItem {
    Table(BaseTable),
    /// Derived table; its alias lives in `SelectQuery::alias`.
    Subquery(Box<SelectQuery>),
    Join(Box<JoinTable>),
    Placeholder(PlaceholderRef),
}

impl FromItem {
    pub fn table(table: BaseTable) -> Self {
        FromItem::Table(table)
    }

    pub fn subquery(query: SelectQuery) -> Self {
        FromItem::Subquery(Box::new(query))
    }

    pub fn join(left: FromItem, right: FromItem, kind: JoinKind, on: Option<Expr>) -> Self {
        FromItem::Join(Box::new(JoinTable {
            left,
            right,
            kind,
            on,
        }))
    }

    /// Names this item binds for column references in the enclosing query.
    pub fn bound_names(&self, out: &mut BTreeSet<String>) {
        match self {
            FromItem::Table(t) => {
                out.insert(t.reference_name().to_string());
            }
            FromItem::Subquery(q) => {
                if let Some(alias) = &q.alias {
                    out.insert(alias.clone());
                }
            }
            FromItem::Join(j) => {
                j.left.bound_names(out);
                j.right.bound_names(out);
            }
            FromItem::Placeholder(p) => {
                out.insert(p.alias.clone());
            }
        }
    }

    /// Base tables referenced directly by this item (join trees flattened,
    /// derived tables not entered).
    pub fn direct_tables<'a>(&'a self, out: &mut Vec<&'a BaseTable>) {
        match self {
            FromItem::Table(t) => out.push(t),
            FromItem::Join(j) => {
                j.left.direct_tables(out);
                j.right.direct_tables(out);
            }
            FromItem::Subquery(_) | FromItem::Placeholder(_) => {}
        }
    }

    /// Derived tables at this item (join trees flattened, derived tables not
    /// entered).
    pub fn direct_subqueries<'a>(&'a self, out: &mut Vec<&'a SelectQuery>) {
        match self {
            FromItem::Subquery(q) => out.push(q.as_ref()),
            FromItem::Join(j) => {
                j.left.direct_subqueries(out);
                j.right.direct_subqueries(out);
            }
            FromItem::Table(_) | FromItem::Placeholder(_) => {}
        }
    }

    /// `ON` conditions of this item's join tree.
    pub fn join_conditions<'a>(&'a self, out: &mut Vec<&'a Expr>) {
        if let FromItem::Join(j) = self {
            j.left.join_conditions(out);
            j.right.join_conditions(out);
            out.extend(j.on.as_ref());
        }
    }

    fn walk_queries<'a>(&'a self, f: &mut dyn FnMut(&'a SelectQuery)) {
        match self {
            FromItem::Subquery(q) => q.walk_queries(f),
            FromItem::Join(j) => {
                j.left.walk_queries(f);
                j.right.walk_queries(f);
                if let Some(on) = &j.on {
                    on.walk_queries(f);
                }
            }
            FromItem::Table(_) | FromItem::Placeholder(_) => {}
        }
    }

    fn walk_queries_mut(&mut self, f: &mut dyn FnMut(&mut SelectQuery)) {
        match self {
            FromItem::Subquery(q) => q.walk_queries_mut(f),
            FromItem::Join(j) => {
                j.left.walk_queries_mut(f);
                j.right.walk_queries_mut(f);
                if let Some(on) = &mut j.on {
                    on.walk_queries_mut(f);
                }
            }
            FromItem::Table(_) | FromItem::Placeholder(_) => {}
        }
    }

    /// Replace placeholders for `node` found at this item (join trees entered,
    /// derived tables not). Returns the number of replacements.
    fn replace_placeholder(&mut self, node: NodeId, replacement: &SelectQuery) -> usize {
        match self {
            FromItem::Placeholder(p) if p.node == node => {
                let mut inlined = replacement.clone();
                inlined.alias = Some(p.alias.clone());
                *self = FromItem::Subquery(Box::new(inlined));
                1
            }
            FromItem::Join(j) => {
                j.left.replace_placeholder(node, replacement)
                    + j.right.replace_placeholder(node, replacement)
            }
            _ => 0,
        }
    }

    fn collect_join_column_tables(&self, out: &mut BTreeSet<String>) {
        if let FromItem::Join(j) = self {
            j.left.collect_join_column_tables(out);
            j.right.collect_join_column_tables(out);
            if let Some(on) = &j.on {
                on.collect_column_tables(out);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Literal {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    And,
    Or,
    Like,
}

impl BinaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Eq => "=",
            BinaryOp::NotEq => "<>",
            BinaryOp::Lt => "<",
            BinaryOp::LtEq => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::GtEq => ">=",
            BinaryOp::And => "AND",
            BinaryOp::Or => "OR",
            BinaryOp::Like => "LIKE",
        }
    }
}

/// How a sub-query is consumed by the expression around it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubqueryKind {
    Scalar,
    In,
    Exists,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Expr {
    Column {
        #[serde(default)]
        table: Option<String>,
        name: String,
    },
    Literal(Literal),
    /// `*` or `t.*` (also the argument of `COUNT(*)`).
    Star {
        #[serde(default)]
        table: Option<String>,
    },
    Func {
        name: String,
        #[serde(default)]
        args: Vec<Expr>,
        #[serde(default)]
        distinct: bool,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Not(Box<Expr>),
    IsNull {
        expr: Box<Expr>,
        #[serde(default)]
        negated: bool,
    },
    Subquery(Box<SelectQuery>),
    InSubquery {
        expr: Box<Expr>,
        subquery: Box<SelectQuery>,
        #[serde(default)]
        negated: bool,
    },
    Exists {
        subquery: Box<SelectQuery>,
        #[serde(default)]
        negated: bool,
    },
}

impl Expr {
    pub fn col(table: impl Into<String>, name: impl Into<String>) -> Self {
        Expr::Column {
            table: Some(table.into()),
            name: name.into(),
        }
    }

    pub fn column(name: impl Into<String>) -> Self {
        Expr::Column {
            table: None,
            name: name.into(),
        }
    }

    pub fn int(v: i64) -> Self {
        Expr::Literal(Literal::Int(v))
    }

    pub fn float(v: f64) -> Self {
        Expr::Literal(Literal::Float(v))
    }

    pub fn string(v: impl Into<String>) -> Self {
        Expr::Literal(Literal::Str(v.into()))
    }

    pub fn func(name: impl Into<String>, args: Vec<Expr>) -> Self {
        Expr::Func {
            name: name.into(),
            args,
            distinct: false,
        }
    }

    pub fn count_star() -> Self {
        Expr::func("count", vec![Expr::Star { table: None }])
    }

    pub fn binary(op: BinaryOp, left: Expr, right: Expr) -> Self {
        Expr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn and(left: Expr, right: Expr) -> Self {
        Expr::binary(BinaryOp::And, left, right)
    }

    pub fn scalar_subquery(query: SelectQuery) -> Self {
        Expr::Subquery(Box::new(query))
    }

    pub fn in_subquery(expr: Expr, query: SelectQuery) -> Self {
        Expr::InSubquery {
            expr: Box::new(expr),
            subquery: Box::new(query),
            negated: false,
        }
    }

    pub fn exists(query: SelectQuery) -> Self {
        Expr::Exists {
            subquery: Box::new(query),
            negated: false,
        }
    }

    pub fn is_aggregate_call(&self) -> bool {
        matches!(self, Expr::Func { name, .. } if is_aggregate_function(name))
    }

    /// True when this expression calls an aggregate at its own level
    /// (sub-queries are separate levels and are not entered).
    pub fn contains_aggregate(&self) -> bool {
        let mut found = false;
        self.for_each_aggregate(&mut |_| found = true);
        found
    }

    /// Visit aggregate calls at this level; their arguments and sub-queries
    /// are not entered.
    pub fn for_each_aggregate<'a>(&'a self, f: &mut dyn FnMut(&'a Expr)) {
        if self.is_aggregate_call() {
            f(self);
            return;
        }
        match self {
            Expr::Func { args, .. } => args.iter().for_each(|a| a.for_each_aggregate(f)),
            Expr::Binary { left, right, .. } => {
                left.for_each_aggregate(f);
                right.for_each_aggregate(f);
            }
            Expr::Not(e) | Expr::IsNull { expr: e, .. } => e.for_each_aggregate(f),
            Expr::InSubquery { expr, .. } => expr.for_each_aggregate(f),
            Expr::Column { .. }
            | Expr::Literal(_)
            | Expr::Star { .. }
            | Expr::Subquery(_)
            | Expr::Exists { .. } => {}
        }
    }

    /// Mutable counterpart of [`Expr::for_each_aggregate`]; `f` may replace the call.
    pub fn rewrite_aggregates(&mut self, f: &mut dyn FnMut(&mut Expr)) {
        if self.is_aggregate_call() {
            f(self);
            return;
        }
        match self {
            Expr::Func { args, .. } => args.iter_mut().for_each(|a| a.rewrite_aggregates(f)),
            Expr::Binary { left, right, .. } => {
                left.rewrite_aggregates(f);
                right.rewrite_aggregates(f);
            }
            Expr::Not(e) | Expr::IsNull { expr: e, .. } => e.rewrite_aggregates(f),
            Expr::InSubquery { expr, .. } => expr.rewrite_aggregates(f),
            Expr::Column { .. }
            | Expr::Literal(_)
            | Expr::Star { .. }
            | Expr::Subquery(_)
            | Expr::Exists { .. } => {}
        }
    }

    /// Visit the sub-query slots directly reachable from this expression
    /// (without entering the sub-queries themselves).
    pub fn for_each_subquery<'a>(&'a self, f: &mut dyn FnMut(SubqueryKind, &'a SelectQuery)) {
        match self {
            Expr::Subquery(q) => f(SubqueryKind::Scalar, q),
            Expr::InSubquery { expr, subquery, .. } => {
                expr.for_each_subquery(f);
                f(SubqueryKind::In, subquery);
            }
            Expr::Exists { subquery, .. } => f(SubqueryKind::Exists, subquery),
            Expr::Func { args, .. } => args.iter().for_each(|a| a.for_each_subquery(f)),
            Expr::Binary { left, right, .. } => {
                left.for_each_subquery(f);
                right.for_each_subquery(f);
            }
            Expr::Not(e) | Expr::IsNull { expr: e, .. } => e.for_each_subquery(f),
            Expr::Column { .. } | Expr::Literal(_) | Expr::Star { .. } => {}
        }
    }

    /// Mutable counterpart of [`Expr::for_each_subquery`].
    pub fn for_each_subquery_mut(&mut self, f: &mut dyn FnMut(SubqueryKind, &mut SelectQuery)) {
        match self {
            Expr::Subquery(q) => f(SubqueryKind::Scalar, q),
            Expr::InSubquery { expr, subquery, .. } => {
                expr.for_each_subquery_mut(f);
                f(SubqueryKind::In, subquery);
            }
            Expr::Exists { subquery, .. } => f(SubqueryKind::Exists, subquery),
            Expr::Func { args, .. } => args.iter_mut().for_each(|a| a.for_each_subquery_mut(f)),
            Expr::Binary { left, right, .. } => {
                left.for_each_subquery_mut(f);
                right.for_each_subquery_mut(f);
            }
            Expr::Not(e) | Expr::IsNull { expr: e, .. } => e.for_each_subquery_mut(f),
            Expr::Column { .. } | Expr::Literal(_) | Expr::Star { .. } => {}
        }
    }

    /// Table qualifiers of column references at this level.
    pub fn collect_column_tables(&self, out: &mut BTreeSet<String>) {
        match self {
            Expr::Column {
                table: Some(t), ..
            }
            | Expr::Star { table: Some(t) } => {
                out.insert(t.clone());
            }
            Expr::Func { args, .. } => args.iter().for_each(|a| a.collect_column_tables(out)),
            Expr::Binary { left, right, .. } => {
                left.collect_column_tables(out);
                right.collect_column_tables(out);
            }
            Expr::Not(e) | Expr::IsNull { expr: e, .. } => e.collect_column_tables(out),
            Expr::InSubquery { expr, .. } => expr.collect_column_tables(out),
            Expr::Column { table: None, .. }
            | Expr::Star { table: None }
            | Expr::Literal(_)
            | Expr::Subquery(_)
            | Expr::Exists { .. } => {}
        }
    }

    fn walk_queries<'a>(&'a self, f: &mut dyn FnMut(&'a SelectQuery)) {
        self.for_each_subquery(&mut |_, q| q.walk_queries(f));
    }

    fn walk_queries_mut(&mut self, f: &mut dyn FnMut(&mut SelectQuery)) {
        self.for_each_subquery_mut(&mut |_, q| q.walk_queries_mut(f));
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectItem {
    pub expr: Expr,
    #[serde(default)]
    pub alias: Option<String>,
}

impl SelectItem {
    pub fn new(expr: Expr) -> Self {
        Self { expr, alias: None }
    }

    pub fn aliased(expr: Expr, alias: impl Into<String>) -> Self {
        Self {
            expr,
            alias: Some(alias.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderItem {
    pub expr: Expr,
    #[serde(default)]
    pub descending: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectQuery {
    pub select_list: Vec<SelectItem>,
    #[serde(default)]
    pub from_list: Vec<FromItem>,
    #[serde(default)]
    pub filter: Option<Expr>,
    #[serde(default)]
    pub group_by: Vec<Expr>,
    #[serde(default)]
    pub having: Option<Expr>,
    #[serde(default)]
    pub order_by: Vec<OrderItem>,
    #[serde(default)]
    pub limit: Option<u64>,
    #[serde(default)]
    pub alias: Option<String>,
}

impl SelectQuery {
    pub fn new(select_list: Vec<SelectItem>, from_list: Vec<FromItem>) -> Self {
        Self {
            select_list,
            from_list,
            filter: None,
            group_by: vec![],
            having: None,
            order_by: vec![],
            limit: None,
            alias: None,
        }
    }

    /// `SELECT * FROM <item>`
    pub fn select_all_from(item: FromItem) -> Self {
        Self::new(vec![SelectItem::new(Expr::Star { table: None })], vec![item])
    }

    pub fn with_filter(mut self, filter: Expr) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_group_by(mut self, group_by: Vec<Expr>) -> Self {
        self.group_by = group_by;
        self
    }

    pub fn with_having(mut self, having: Expr) -> Self {
        self.having = Some(having);
        self
    }

    pub fn with_order_by(mut self, order_by: Vec<OrderItem>) -> Self {
        self.order_by = order_by;
        self
    }

    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    /// AND `predicate` into the WHERE clause.
    pub fn add_filter(&mut self, predicate: Expr) {
        self.filter = Some(match self.filter.take() {
            Some(existing) => Expr::and(existing, predicate),
            None => predicate,
        });
    }

    /// This level aggregates: GROUP BY present, or an aggregate call in the
    /// select list or HAVING.
    pub fn is_aggregate_level(&self) -> bool {
        !self.group_by.is_empty()
            || self.select_list.iter().any(|s| s.expr.contains_aggregate())
            || self.having.as_ref().is_some_and(Expr::contains_aggregate)
    }

    /// This level aggregates, or some sub-query in its from-list or filter does.
    pub fn is_aggregate(&self) -> bool {
        if self.is_aggregate_level() {
            return true;
        }
        let mut nested = false;
        for item in &self.from_list {
            item.walk_queries(&mut |q| nested |= q.is_aggregate_level());
        }
        if let Some(filter) = &self.filter {
            filter.walk_queries(&mut |q| nested |= q.is_aggregate_level());
        }
        nested
    }

    /// Names bound by this query's from-list.
    pub fn bound_names(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        for item in &self.from_list {
            item.bound_names(&mut out);
        }
        out
    }

    /// Table qualifiers this query references but does not bind itself,
    /// including those escaping from nested sub-queries.
    pub fn free_table_refs(&self) -> BTreeSet<String> {
        let mut refs = BTreeSet::new();
        for expr in self.exprs() {
            expr.collect_column_tables(&mut refs);
            expr.for_each_subquery(&mut |_, q| refs.extend(q.free_table_refs()));
        }
        for item in &self.from_list {
            item.collect_join_column_tables(&mut refs);
            let mut nested = Vec::new();
            collect_from_queries(item, &mut nested);
            for q in nested {
                refs.extend(q.free_table_refs());
            }
        }
        let bound = self.bound_names();
        refs.retain(|r| !bound.contains(r));
        refs
    }

    /// References an alias bound by an enclosing scope.
    pub fn is_correlated(&self) -> bool {
        !self.free_table_refs().is_empty()
    }

    /// `Some(node)` when this query is exactly `SELECT * FROM <placeholder for node>`,
    /// the marker a filter sub-query is replaced with.
    pub fn placeholder_marker(&self) -> Option<NodeId> {
        let bare = self.filter.is_none()
            && self.group_by.is_empty()
            && self.having.is_none()
            && self.order_by.is_empty()
            && self.limit.is_none();
        match (self.select_list.as_slice(), self.from_list.as_slice()) {
            (
                [SelectItem {
                    expr: Expr::Star { table: None },
                    alias: None,
                }],
                [FromItem::Placeholder(p)],
            ) if bare => Some(p.node),
            _ => None,
        }
    }

    /// Every placeholder reference anywhere in the query tree.
    pub fn placeholders(&self) -> Vec<&PlaceholderRef> {
        let mut out = Vec::new();
        self.walk_queries(&mut |q| {
            for item in &q.from_list {
                collect_placeholders(item, &mut out);
            }
        });
        out
    }

    /// Base tables in pre-order: a query's own from-list before the queries
    /// nested inside it.
    pub fn base_tables(&self) -> Vec<&BaseTable> {
        let mut out = Vec::new();
        self.walk_queries(&mut |q| {
            for item in &q.from_list {
                item.direct_tables(&mut out);
            }
        });
        out
    }

    /// Replace from-list placeholders for `node` anywhere in the tree with
    /// `replacement` (aliased with the placeholder's alias). Filter markers
    /// are left alone. Returns the number of replacements.
    pub fn replace_placeholder_table(&mut self, node: NodeId, replacement: &SelectQuery) -> usize {
        let mut replaced = 0;
        self.walk_queries_mut(&mut |q| {
            if q.placeholder_marker() == Some(node) {
                return;
            }
            for item in &mut q.from_list {
                replaced += item.replace_placeholder(node, replacement);
            }
        });
        replaced
    }

    /// Replace filter markers for `node` anywhere in the tree with
    /// `replacement`, keeping the surrounding operator. Returns the number of
    /// replacements.
    pub fn replace_placeholder_filter(&mut self, node: NodeId, replacement: &SelectQuery) -> usize {
        let mut replaced = 0;
        self.walk_queries_mut(&mut |q| {
            for expr in q.exprs_mut() {
                expr.for_each_subquery_mut(&mut |_, slot| {
                    if slot.placeholder_marker() == Some(node) {
                        let mut inlined = replacement.clone();
                        inlined.alias = None;
                        *slot = inlined;
                        replaced += 1;
                    }
                });
            }
        });
        replaced
    }

    /// Expressions at this level: select list, WHERE, GROUP BY, HAVING, ORDER BY.
    pub fn exprs(&self) -> Vec<&Expr> {
        let mut out: Vec<&Expr> = self.select_list.iter().map(|s| &s.expr).collect();
        out.extend(self.filter.as_ref());
        out.extend(self.group_by.iter());
        out.extend(self.having.as_ref());
        out.extend(self.order_by.iter().map(|o| &o.expr));
        out
    }

    pub fn exprs_mut(&mut self) -> Vec<&mut Expr> {
        let mut out: Vec<&mut Expr> = self.select_list.iter_mut().map(|s| &mut s.expr).collect();
        out.extend(self.filter.as_mut());
        out.extend(self.group_by.iter_mut());
        out.extend(self.having.as_mut());
        out.extend(self.order_by.iter_mut().map(|o| &mut o.expr));
        out
    }

    /// Pre-order walk over this query and every query nested in it.
    pub fn walk_queries<'a>(&'a self, f: &mut dyn FnMut(&'a SelectQuery)) {
        f(self);
        for item in &self.from_list {
            item.walk_queries(f);
        }
        for expr in self.exprs() {
            expr.walk_queries(f);
        }
    }

    pub fn walk_queries_mut(&mut self, f: &mut dyn FnMut(&mut SelectQuery)) {
        f(self);
        for item in &mut self.from_list {
            item.walk_queries_mut(f);
        }
        for expr in self.exprs_mut() {
            expr.walk_queries_mut(f);
        }
    }
}

fn collect_from_queries<'a>(item: &'a FromItem, out: &mut Vec<&'a SelectQuery>) {
    match item {
        FromItem::Subquery(q) => out.push(q),
        FromItem::Join(j) => {
            collect_from_queries(&j.left, out);
            collect_from_queries(&j.right, out);
            if let Some(on) = &j.on {
                on.for_each_subquery(&mut |_, q| out.push(q));
            }
        }
        FromItem::Table(_) | FromItem::Placeholder(_) => {}
    }
}

fn collect_placeholders<'a>(item: &'a FromItem, out: &mut Vec<&'a PlaceholderRef>) {
    match item {
        FromItem::Placeholder(p) => out.push(p),
        FromItem::Join(j) => {
            collect_placeholders(&j.left, out);
            collect_placeholders(&j.right, out);
        }
        FromItem::Table(_) | FromItem::Subquery(_) => {}
    }
}
