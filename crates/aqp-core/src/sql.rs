//! SQL text generation.
//!
//! `SqlSyntax` captures the per-dialect bits (identifier quoting); the
//! generator itself is dialect-neutral. Every binary expression is
//! parenthesized so operator precedence never depends on the dialect.

use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::query::{Expr, FromItem, JoinKind, Literal, SelectQuery, TableName};

pub trait SqlSyntax: Send + Sync {
    fn name(&self) -> &'static str;

    fn quote_char(&self) -> char;

    fn quote_identifier(&self, ident: &str) -> String {
        let q = self.quote_char();
        let mut out = String::with_capacity(ident.len() + 2);
        out.push(q);
        for c in ident.chars() {
            if c == q {
                out.push(q);
            }
            out.push(c);
        }
        out.push(q);
        out
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AnsiSyntax;

impl SqlSyntax for AnsiSyntax {
    fn name(&self) -> &'static str {
        "ansi"
    }

    fn quote_char(&self) -> char {
        '"'
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HiveSyntax;

impl SqlSyntax for HiveSyntax {
    fn name(&self) -> &'static str {
        "hive"
    }

    fn quote_char(&self) -> char {
        '`'
    }
}

/// Statements the engine sends to the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Statement {
    Select(SelectQuery),
    CreateTableAs { table: TableName, query: SelectQuery },
    DropTable { table: TableName, if_exists: bool },
}

pub struct SqlGenerator<'a> {
    syntax: &'a dyn SqlSyntax,
}

impl<'a> SqlGenerator<'a> {
    pub fn new(syntax: &'a dyn SqlSyntax) -> Self {
        Self { syntax }
    }

    pub fn to_sql(&self, stmt: &Statement) -> Result<String> {
        match stmt {
            Statement::Select(q) => self.select(q),
            Statement::CreateTableAs { table, query } => Ok(format!(
                "CREATE TABLE {} AS {}",
                self.table_name(table),
                self.select(query)?
            )),
            Statement::DropTable { table, if_exists } => Ok(format!(
                "DROP TABLE {}{}",
                if *if_exists { "IF EXISTS " } else { "" },
                self.table_name(table)
            )),
        }
    }

    pub fn select(&self, q: &SelectQuery) -> Result<String> {
        if q.select_list.is_empty() {
            return Err(Error::Sql("empty select list".into()));
        }
        let mut out = String::from("SELECT ");
        let items = q
            .select_list
            .iter()
            .map(|item| {
                let mut s = self.expr(&item.expr)?;
                if let Some(alias) = &item.alias {
                    let _ = write!(s, " AS {}", self.ident(alias));
                }
                Ok(s)
            })
            .collect::<Result<Vec<_>>>()?;
        out.push_str(&items.join(", "));

        if !q.from_list.is_empty() {
            let from = q
                .from_list
                .iter()
                .map(|f| self.from_item(f))
                .collect::<Result<Vec<_>>>()?;
            let _ = write!(out, " FROM {}", from.join(", "));
        }
        if let Some(filter) = &q.filter {
            let _ = write!(out, " WHERE {}", self.expr(filter)?);
        }
        if !q.group_by.is_empty() {
            let keys = self.expr_list(&q.group_by)?;
            let _ = write!(out, " GROUP BY {keys}");
        }
        if let Some(having) = &q.having {
            let _ = write!(out, " HAVING {}", self.expr(having)?);
        }
        if !q.order_by.is_empty() {
            let items = q
                .order_by
                .iter()
                .map(|o| {
                    let e = self.expr(&o.expr)?;
                    Ok(if o.descending { format!("{e} DESC") } else { e })
                })
                .collect::<Result<Vec<_>>>()?;
            let _ = write!(out, " ORDER BY {}", items.join(", "));
        }
        if let Some(limit) = q.limit {
            let _ = write!(out, " LIMIT {limit}");
        }
        Ok(out)
    }

    fn ident(&self, ident: &str) -> String {
        self.syntax.quote_identifier(ident)
    }

    fn table_name(&self, t: &TableName) -> String {
        format!("{}.{}", self.ident(&t.schema), self.ident(&t.table))
    }

    fn from_item(&self, item: &FromItem) -> Result<String> {
        Ok(match item {
            FromItem::Table(t) => {
                let mut s = self.table_name(&t.name());
                if let Some(alias) = &t.alias {
                    let _ = write!(s, " AS {}", self.ident(alias));
                }
                s
            }
            FromItem::Placeholder(p) => {
                format!("{} AS {}", self.table_name(&p.table), self.ident(&p.alias))
            }
            FromItem::Subquery(q) => {
                let mut s = format!("({})", self.select(q)?);
                if let Some(alias) = &q.alias {
                    let _ = write!(s, " AS {}", self.ident(alias));
                }
                s
            }
            FromItem::Join(j) => {
                let kw = match j.kind {
                    JoinKind::Inner => "INNER JOIN",
                    JoinKind::Left => "LEFT JOIN",
                    JoinKind::Right => "RIGHT JOIN",
                    JoinKind::Full => "FULL JOIN",
                    JoinKind::Cross => "CROSS JOIN",
                };
                let mut s = format!(
                    "{} {kw} {}",
                    self.from_item(&j.left)?,
                    self.from_item(&j.right)?
                );
                if let Some(on) = &j.on {
                    let _ = write!(s, " ON {}", self.expr(on)?);
                }
                s
            }
        })
    }

    fn expr_list(&self, exprs: &[Expr]) -> Result<String> {
        Ok(exprs
            .iter()
            .map(|e| self.expr(e))
            .collect::<Result<Vec<_>>>()?
            .join(", "))
    }

    pub fn expr(&self, e: &Expr) -> Result<String> {
        Ok(match e {
            Expr::Column { table, name } => match table {
                Some(t) => format!("{}.{}", self.ident(t), self.ident(name)),
                None => self.ident(name),
            },
            Expr::Literal(lit) => literal(lit),
            Expr::Star { table } => match table {
                Some(t) => format!("{}.*", self.ident(t)),
                None => "*".to_string(),
            },
            Expr::Func {
                name,
                args,
                distinct,
            } => format!(
                "{}({}{})",
                name.to_ascii_lowercase(),
                if *distinct { "DISTINCT " } else { "" },
                self.expr_list(args)?
            ),
            Expr::Binary { op, left, right } => format!(
                "({} {} {})",
                self.expr(left)?,
                op.symbol(),
                self.expr(right)?
            ),
            Expr::Not(inner) => format!("(NOT {})", self.expr(inner)?),
            Expr::IsNull { expr, negated } => format!(
                "({} IS {}NULL)",
                self.expr(expr)?,
                if *negated { "NOT " } else { "" }
            ),
            Expr::Subquery(q) => format!("({})", self.select(q)?),
            Expr::InSubquery {
                expr,
                subquery,
                negated,
            } => format!(
                "({} {}IN ({}))",
                self.expr(expr)?,
                if *negated { "NOT " } else { "" },
                self.select(subquery)?
            ),
            Expr::Exists { subquery, negated } => format!(
                "({}EXISTS ({}))",
                if *negated { "NOT " } else { "" },
                self.select(subquery)?
            ),
        })
    }
}

fn literal(lit: &Literal) -> String {
    match lit {
        Literal::Null => "NULL".to_string(),
        Literal::Bool(true) => "TRUE".to_string(),
        Literal::Bool(false) => "FALSE".to_string(),
        Literal::Int(v) => v.to_string(),
        Literal::Float(v) if v.is_finite() && v.fract() == 0.0 => format!("{v:.1}"),
        Literal::Float(v) => v.to_string(),
        Literal::Str(s) => format!("'{}'", s.replace('\'', "''")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::NodeId;
    use crate::query::{BaseTable, BinaryOp, PlaceholderRef, SelectItem};

    fn people() -> FromItem {
        FromItem::table(BaseTable::new("default", "people").with_alias("t"))
    }

    #[test]
    fn renders_simple_aggregate() {
        let q = SelectQuery::new(
            vec![
                SelectItem::aliased(Expr::count_star(), "c"),
                SelectItem::new(Expr::col("t", "city")),
            ],
            vec![people()],
        )
        .with_filter(Expr::binary(BinaryOp::Gt, Expr::col("t", "age"), Expr::int(30)))
        .with_group_by(vec![Expr::col("t", "city")]);

        let sql = SqlGenerator::new(&AnsiSyntax).select(&q).unwrap();
        assert_eq!(
            sql,
            r#"SELECT count(*) AS "c", "t"."city" FROM "default"."people" AS "t" WHERE ("t"."age" > 30) GROUP BY "t"."city""#
        );
    }

    #[test]
    fn hive_uses_backticks_and_escapes() {
        assert_eq!(HiveSyntax.quote_identifier("a`b"), "`a``b`");
        assert_eq!(AnsiSyntax.quote_identifier("x\"y"), "\"x\"\"y\"");
    }

    #[test]
    fn renders_ddl_and_placeholders() {
        let gen = SqlGenerator::new(&HiveSyntax);
        let q = SelectQuery::select_all_from(FromItem::Placeholder(PlaceholderRef {
            node: NodeId::new(1),
            table: TableName::new("scratch", "tmp_1"),
            alias: "s".into(),
        }));
        let ctas = Statement::CreateTableAs {
            table: TableName::new("scratch", "tmp_0"),
            query: q,
        };
        assert_eq!(
            gen.to_sql(&ctas).unwrap(),
            "CREATE TABLE `scratch`.`tmp_0` AS SELECT * FROM `scratch`.`tmp_1` AS `s`"
        );
        let drop = Statement::DropTable {
            table: TableName::new("scratch", "tmp_0"),
            if_exists: true,
        };
        assert_eq!(
            gen.to_sql(&drop).unwrap(),
            "DROP TABLE IF EXISTS `scratch`.`tmp_0`"
        );
    }

    #[test]
    fn literals() {
        assert_eq!(literal(&Literal::Float(4.0)), "4.0");
        assert_eq!(literal(&Literal::Float(1.5)), "1.5");
        assert_eq!(literal(&Literal::Str("it's".into())), "'it''s'");
    }

    #[test]
    fn empty_select_list_is_an_error() {
        let q = SelectQuery::new(vec![], vec![people()]);
        assert!(SqlGenerator::new(&AnsiSyntax).select(&q).is_err());
    }
}
