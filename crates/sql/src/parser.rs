use crate::{
    ast::*,
    lexer::{
        tokenize,
        SpannedToken,
        Token,
    },
    ParseError,
};

/// Words that terminate an implicit alias position. A bare identifier after
/// an expression or table factor is only an alias if it is not one of these.
const RESERVED: &[&str] = &[
    "FROM", "WHERE", "GROUP", "HAVING", "ORDER", "LIMIT", "OFFSET", "UNION", "INTERSECT",
    "EXCEPT", "JOIN", "INNER", "LEFT", "RIGHT", "FULL", "OUTER", "CROSS", "NATURAL", "ON",
    "USING", "SET", "RETURNING", "AND", "OR", "NOT", "AS", "BY", "ASC", "DESC", "VALUES",
    "WHEN", "THEN", "ELSE", "END", "IN", "IS", "LIKE", "BETWEEN", "EXISTS", "SELECT", "ALL",
    "DISTINCT", "WITH", "RECURSIVE",
];

pub fn parse_statement(input: &str) -> Result<Statement, ParseError> {
    let tokens = tokenize(input)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        max_param: 0,
    };
    let statement = parser.statement()?;
    while parser.eat(&Token::Semicolon) {}
    if let Some(t) = parser.peek() {
        return Err(ParseError::at(
            format!("unexpected trailing input: {:?}", t.token),
            t.offset,
        ));
    }
    Ok(statement)
}

struct Parser {
    tokens: Vec<SpannedToken>,
    pos: usize,
    /// Largest 1-based parameter index assigned so far; an unnumbered `?`
    /// takes the next one, as SQLite does.
    max_param: usize,
}

impl Parser {
    fn peek(&self) -> Option<&SpannedToken> {
        self.tokens.get(self.pos)
    }

    fn peek_at(&self, ahead: usize) -> Option<&Token> {
        self.tokens.get(self.pos + ahead).map(|t| &t.token)
    }

    fn advance(&mut self) -> Option<SpannedToken> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn offset(&self) -> usize {
        self.peek().map(|t| t.offset).unwrap_or(usize::MAX)
    }

    fn error(&self, message: impl Into<String>) -> ParseError {
        ParseError::at(message, self.offset())
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek().map(|t| &t.token) == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: &Token) -> Result<(), ParseError> {
        if self.eat(token) {
            Ok(())
        } else {
            Err(self.error(format!("expected {token:?}")))
        }
    }

    fn peek_keyword(&self, keyword: &str) -> bool {
        self.peek_keyword_at(0, keyword)
    }

    fn peek_keyword_at(&self, ahead: usize, keyword: &str) -> bool {
        matches!(
            self.peek_at(ahead),
            Some(Token::Ident(word)) if word.eq_ignore_ascii_case(keyword)
        )
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        if self.peek_keyword(keyword) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_keyword(&mut self, keyword: &str) -> Result<(), ParseError> {
        if self.eat_keyword(keyword) {
            Ok(())
        } else {
            Err(self.error(format!("expected {keyword}")))
        }
    }

    fn identifier(&mut self) -> Result<String, ParseError> {
        match self.advance() {
            Some(SpannedToken {
                token: Token::Ident(name),
                ..
            }) => Ok(name),
            Some(SpannedToken {
                token: Token::Quoted(name),
                ..
            }) => Ok(name),
            other => Err(ParseError::at(
                format!("expected identifier, got {:?}", other.map(|t| t.token)),
                self.offset(),
            )),
        }
    }

    /// An optional `[AS] alias`, stopping at reserved words.
    fn maybe_alias(&mut self) -> Result<Option<String>, ParseError> {
        if self.eat_keyword("AS") {
            return Ok(Some(self.identifier()?));
        }
        match self.peek().map(|t| &t.token) {
            Some(Token::Ident(word)) if !is_reserved(word) => {
                let alias = word.clone();
                self.pos += 1;
                Ok(Some(alias))
            },
            Some(Token::Quoted(word)) => {
                let alias = word.clone();
                self.pos += 1;
                Ok(Some(alias))
            },
            _ => Ok(None),
        }
    }

    // Statements

    fn statement(&mut self) -> Result<Statement, ParseError> {
        if self.peek_keyword("SELECT") || self.peek_keyword("WITH") {
            return Ok(Statement::Select(self.query()?));
        }
        if self.peek_keyword("INSERT") {
            return Ok(Statement::Insert(self.insert()?));
        }
        if self.peek_keyword("UPDATE") {
            return Ok(Statement::Update(self.update()?));
        }
        if self.peek_keyword("DELETE") {
            return Ok(Statement::Delete(self.delete()?));
        }
        Err(self.error("expected SELECT, INSERT, UPDATE or DELETE"))
    }

    fn query(&mut self) -> Result<Query, ParseError> {
        let with = if self.eat_keyword("WITH") {
            let recursive = self.eat_keyword("RECURSIVE");
            let mut ctes = Vec::new();
            loop {
                let name = self.identifier()?;
                // Optional column list, e.g. `WITH c(a, b) AS (…)`.
                if self.eat(&Token::LParen) {
                    loop {
                        self.identifier()?;
                        if !self.eat(&Token::Comma) {
                            break;
                        }
                    }
                    self.expect(&Token::RParen)?;
                }
                self.expect_keyword("AS")?;
                self.expect(&Token::LParen)?;
                let query = self.query()?;
                self.expect(&Token::RParen)?;
                ctes.push(Cte { name, query });
                if !self.eat(&Token::Comma) {
                    break;
                }
            }
            Some(With { recursive, ctes })
        } else {
            None
        };

        let first = self.select_core()?;
        let mut compounds = Vec::new();
        loop {
            let op = if self.eat_keyword("UNION") {
                if self.eat_keyword("ALL") {
                    SetOp::UnionAll
                } else {
                    SetOp::Union
                }
            } else if self.eat_keyword("INTERSECT") {
                SetOp::Intersect
            } else if self.eat_keyword("EXCEPT") {
                SetOp::Except
            } else {
                break;
            };
            compounds.push((op, self.select_core()?));
        }

        let mut order_by = Vec::new();
        if self.eat_keyword("ORDER") {
            self.expect_keyword("BY")?;
            loop {
                let expr = self.expr()?;
                let desc = if self.eat_keyword("DESC") {
                    true
                } else {
                    self.eat_keyword("ASC");
                    false
                };
                order_by.push(OrderByItem { expr, desc });
                if !self.eat(&Token::Comma) {
                    break;
                }
            }
        }

        let mut limit = None;
        let mut offset = None;
        if self.eat_keyword("LIMIT") {
            let first_expr = self.expr()?;
            if self.eat(&Token::Comma) {
                // `LIMIT offset, limit` spelling.
                offset = Some(first_expr);
                limit = Some(self.expr()?);
            } else {
                limit = Some(first_expr);
                if self.eat_keyword("OFFSET") {
                    offset = Some(self.expr()?);
                }
            }
        }

        Ok(Query {
            with,
            first,
            compounds,
            order_by,
            limit,
            offset,
        })
    }

    fn select_core(&mut self) -> Result<SelectCore, ParseError> {
        self.expect_keyword("SELECT")?;
        let distinct = if self.eat_keyword("DISTINCT") {
            true
        } else {
            self.eat_keyword("ALL");
            false
        };

        let mut projection = Vec::new();
        loop {
            projection.push(self.select_item()?);
            if !self.eat(&Token::Comma) {
                break;
            }
        }

        let from = if self.eat_keyword("FROM") {
            Some(self.from_clause()?)
        } else {
            None
        };
        let where_clause = if self.eat_keyword("WHERE") {
            Some(self.expr()?)
        } else {
            None
        };
        let mut group_by = Vec::new();
        if self.eat_keyword("GROUP") {
            self.expect_keyword("BY")?;
            loop {
                group_by.push(self.expr()?);
                if !self.eat(&Token::Comma) {
                    break;
                }
            }
        }
        let having = if self.eat_keyword("HAVING") {
            Some(self.expr()?)
        } else {
            None
        };

        Ok(SelectCore {
            distinct,
            projection,
            from,
            where_clause,
            group_by,
            having,
        })
    }

    fn select_item(&mut self) -> Result<SelectItem, ParseError> {
        if self.eat(&Token::Star) {
            return Ok(SelectItem::Wildcard(None));
        }
        // `table.*`
        if let (Some(Token::Ident(table)) | Some(Token::Quoted(table)), Some(Token::Dot)) =
            (self.peek_at(0), self.peek_at(1))
        {
            if self.peek_at(2) == Some(&Token::Star) {
                let table = table.clone();
                self.pos += 3;
                return Ok(SelectItem::Wildcard(Some(table)));
            }
        }
        let expr = self.expr()?;
        let alias = self.maybe_alias()?;
        Ok(SelectItem::Expr { expr, alias })
    }

    fn from_clause(&mut self) -> Result<FromClause, ParseError> {
        let first = self.table_factor()?;
        let mut joins = Vec::new();
        loop {
            if self.eat(&Token::Comma) {
                joins.push(Join {
                    kind: JoinKind::Cross,
                    factor: self.table_factor()?,
                    on: None,
                });
                continue;
            }
            let kind = if self.eat_keyword("CROSS") {
                self.expect_keyword("JOIN")?;
                JoinKind::Cross
            } else if self.eat_keyword("INNER") {
                self.expect_keyword("JOIN")?;
                JoinKind::Inner
            } else if self.eat_keyword("LEFT") {
                self.eat_keyword("OUTER");
                self.expect_keyword("JOIN")?;
                JoinKind::Left
            } else if self.eat_keyword("RIGHT") {
                self.eat_keyword("OUTER");
                self.expect_keyword("JOIN")?;
                JoinKind::Right
            } else if self.eat_keyword("JOIN") {
                JoinKind::Inner
            } else {
                break;
            };
            let factor = self.table_factor()?;
            let on = if self.eat_keyword("ON") {
                Some(self.expr()?)
            } else {
                None
            };
            joins.push(Join { kind, factor, on });
        }
        Ok(FromClause { first, joins })
    }

    fn table_factor(&mut self) -> Result<TableFactor, ParseError> {
        if self.eat(&Token::LParen) {
            let subquery = self.query()?;
            self.expect(&Token::RParen)?;
            let alias = self.maybe_alias()?;
            return Ok(TableFactor::Derived {
                subquery: Box::new(subquery),
                alias,
            });
        }
        let name = self.identifier()?;
        let alias = self.maybe_alias()?;
        Ok(TableFactor::Table(TableRef { name, alias }))
    }

    fn insert(&mut self) -> Result<InsertStatement, ParseError> {
        self.expect_keyword("INSERT")?;
        if self.eat_keyword("OR") {
            // INSERT OR REPLACE / IGNORE / ABORT / FAIL / ROLLBACK
            self.identifier()?;
        }
        self.expect_keyword("INTO")?;
        let name = self.identifier()?;
        let alias = self.maybe_alias_for_insert()?;
        let table = TableRef { name, alias };

        let mut columns = Vec::new();
        if self.eat(&Token::LParen) {
            loop {
                columns.push(self.identifier()?);
                if !self.eat(&Token::Comma) {
                    break;
                }
            }
            self.expect(&Token::RParen)?;
        }

        let source = if self.eat_keyword("VALUES") {
            let mut rows = Vec::new();
            loop {
                self.expect(&Token::LParen)?;
                let mut row = Vec::new();
                loop {
                    row.push(self.expr()?);
                    if !self.eat(&Token::Comma) {
                        break;
                    }
                }
                self.expect(&Token::RParen)?;
                rows.push(row);
                if !self.eat(&Token::Comma) {
                    break;
                }
            }
            InsertSource::Values(rows)
        } else if self.eat_keyword("DEFAULT") {
            self.expect_keyword("VALUES")?;
            InsertSource::DefaultValues
        } else if self.peek_keyword("SELECT") || self.peek_keyword("WITH") {
            InsertSource::Select(Box::new(self.query()?))
        } else {
            return Err(self.error("expected VALUES, SELECT or DEFAULT VALUES"));
        };

        let returning = self.maybe_returning()?;
        Ok(InsertStatement {
            table,
            columns,
            source,
            returning,
        })
    }

    /// Insert aliases may not swallow the column list opener or VALUES.
    fn maybe_alias_for_insert(&mut self) -> Result<Option<String>, ParseError> {
        if self.eat_keyword("AS") {
            return Ok(Some(self.identifier()?));
        }
        Ok(None)
    }

    fn update(&mut self) -> Result<UpdateStatement, ParseError> {
        self.expect_keyword("UPDATE")?;
        if self.eat_keyword("OR") {
            self.identifier()?;
        }
        let name = self.identifier()?;
        let alias = if self.eat_keyword("AS") {
            Some(self.identifier()?)
        } else {
            None
        };
        let table = TableRef { name, alias };
        self.expect_keyword("SET")?;
        let mut assignments = Vec::new();
        loop {
            let column = self.identifier()?;
            self.expect(&Token::Eq)?;
            assignments.push((column, self.expr()?));
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        let from = if self.eat_keyword("FROM") {
            Some(self.from_clause()?)
        } else {
            None
        };
        let where_clause = if self.eat_keyword("WHERE") {
            Some(self.expr()?)
        } else {
            None
        };
        let returning = self.maybe_returning()?;
        Ok(UpdateStatement {
            table,
            assignments,
            from,
            where_clause,
            returning,
        })
    }

    fn delete(&mut self) -> Result<DeleteStatement, ParseError> {
        self.expect_keyword("DELETE")?;
        self.expect_keyword("FROM")?;
        let name = self.identifier()?;
        let alias = if self.eat_keyword("AS") {
            Some(self.identifier()?)
        } else {
            match self.peek().map(|t| &t.token) {
                Some(Token::Ident(word)) if !is_reserved(word) => {
                    let alias = word.clone();
                    self.pos += 1;
                    Some(alias)
                },
                _ => None,
            }
        };
        let table = TableRef { name, alias };
        let using = if self.eat_keyword("USING") {
            Some(self.from_clause()?)
        } else {
            None
        };
        let where_clause = if self.eat_keyword("WHERE") {
            Some(self.expr()?)
        } else {
            None
        };
        let returning = self.maybe_returning()?;
        Ok(DeleteStatement {
            table,
            using,
            where_clause,
            returning,
        })
    }

    fn maybe_returning(&mut self) -> Result<Vec<SelectItem>, ParseError> {
        if !self.eat_keyword("RETURNING") {
            return Ok(Vec::new());
        }
        let mut items = Vec::new();
        loop {
            items.push(self.select_item()?);
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        Ok(items)
    }

    // Expressions, lowest precedence first.

    fn expr(&mut self) -> Result<Expr, ParseError> {
        self.or_expr()
    }

    fn or_expr(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.and_expr()?;
        while self.eat_keyword("OR") {
            let rhs = self.and_expr()?;
            lhs = Expr::Binary {
                lhs: Box::new(lhs),
                op: BinaryOp::Or,
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn and_expr(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.not_expr()?;
        while self.eat_keyword("AND") {
            let rhs = self.not_expr()?;
            lhs = Expr::Binary {
                lhs: Box::new(lhs),
                op: BinaryOp::And,
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn not_expr(&mut self) -> Result<Expr, ParseError> {
        if self.eat_keyword("NOT") {
            return Ok(Expr::Not(Box::new(self.not_expr()?)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr, ParseError> {
        let lhs = self.additive()?;

        let op = match self.peek().map(|t| &t.token) {
            Some(Token::Eq) => Some(BinaryOp::Eq),
            Some(Token::Neq) => Some(BinaryOp::NotEq),
            Some(Token::Lt) => Some(BinaryOp::Lt),
            Some(Token::LtEq) => Some(BinaryOp::LtEq),
            Some(Token::Gt) => Some(BinaryOp::Gt),
            Some(Token::GtEq) => Some(BinaryOp::GtEq),
            _ => None,
        };
        if let Some(op) = op {
            self.pos += 1;
            let rhs = self.additive()?;
            return Ok(Expr::Binary {
                lhs: Box::new(lhs),
                op,
                rhs: Box::new(rhs),
            });
        }

        if self.eat_keyword("IS") {
            let negated = self.eat_keyword("NOT");
            self.expect_keyword("NULL")?;
            return Ok(Expr::IsNull {
                expr: Box::new(lhs),
                negated,
            });
        }

        let negated = self.eat_keyword("NOT");
        if self.eat_keyword("LIKE") {
            let rhs = self.additive()?;
            return Ok(Expr::Binary {
                lhs: Box::new(lhs),
                op: if negated {
                    BinaryOp::NotLike
                } else {
                    BinaryOp::Like
                },
                rhs: Box::new(rhs),
            });
        }
        if self.eat_keyword("IN") {
            self.expect(&Token::LParen)?;
            if self.peek_keyword("SELECT") || self.peek_keyword("WITH") {
                let subquery = self.query()?;
                self.expect(&Token::RParen)?;
                return Ok(Expr::InSubquery {
                    expr: Box::new(lhs),
                    subquery: Box::new(subquery),
                    negated,
                });
            }
            let mut list = Vec::new();
            if !self.eat(&Token::RParen) {
                loop {
                    list.push(self.expr()?);
                    if !self.eat(&Token::Comma) {
                        break;
                    }
                }
                self.expect(&Token::RParen)?;
            }
            return Ok(Expr::InList {
                expr: Box::new(lhs),
                list,
                negated,
            });
        }
        if self.eat_keyword("BETWEEN") {
            let lo = self.additive()?;
            self.expect_keyword("AND")?;
            let hi = self.additive()?;
            return Ok(Expr::Between {
                expr: Box::new(lhs),
                negated,
                lo: Box::new(lo),
                hi: Box::new(hi),
            });
        }
        if negated {
            return Err(self.error("expected LIKE, IN or BETWEEN after NOT"));
        }
        Ok(lhs)
    }

    fn additive(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.multiplicative()?;
        loop {
            let op = match self.peek().map(|t| &t.token) {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Subtract,
                Some(Token::Concat) => BinaryOp::Concat,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.multiplicative()?;
            lhs = Expr::Binary {
                lhs: Box::new(lhs),
                op,
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn multiplicative(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek().map(|t| &t.token) {
                Some(Token::Star) => BinaryOp::Multiply,
                Some(Token::Slash) => BinaryOp::Divide,
                Some(Token::Percent) => BinaryOp::Modulo,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.unary()?;
            lhs = Expr::Binary {
                lhs: Box::new(lhs),
                op,
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr, ParseError> {
        if self.eat(&Token::Minus) {
            return Ok(Expr::Neg(Box::new(self.unary()?)));
        }
        if self.eat(&Token::Plus) {
            return self.unary();
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Expr, ParseError> {
        match self.peek().map(|t| t.token.clone()) {
            Some(Token::Int(n)) => {
                self.pos += 1;
                Ok(Expr::Literal(Literal::Integer(n)))
            },
            Some(Token::Float(f)) => {
                self.pos += 1;
                Ok(Expr::Literal(Literal::Real(f)))
            },
            Some(Token::Str(s)) => {
                self.pos += 1;
                Ok(Expr::Literal(Literal::String(s)))
            },
            Some(Token::Param(explicit)) => {
                self.pos += 1;
                let index = match explicit {
                    Some(n) if n >= 1 => {
                        self.max_param = self.max_param.max(n);
                        n - 1
                    },
                    Some(_) => return Err(self.error("parameter indexes are 1-based")),
                    None => {
                        self.max_param += 1;
                        self.max_param - 1
                    },
                };
                Ok(Expr::Param(index))
            },
            Some(Token::LParen) => {
                self.pos += 1;
                if self.peek_keyword("SELECT") || self.peek_keyword("WITH") {
                    let subquery = self.query()?;
                    self.expect(&Token::RParen)?;
                    return Ok(Expr::Subquery(Box::new(subquery)));
                }
                let inner = self.expr()?;
                self.expect(&Token::RParen)?;
                Ok(Expr::Nested(Box::new(inner)))
            },
            Some(Token::Ident(word)) if word.eq_ignore_ascii_case("NULL") => {
                self.pos += 1;
                Ok(Expr::Literal(Literal::Null))
            },
            Some(Token::Ident(word)) if word.eq_ignore_ascii_case("TRUE") => {
                self.pos += 1;
                Ok(Expr::Literal(Literal::Boolean(true)))
            },
            Some(Token::Ident(word)) if word.eq_ignore_ascii_case("FALSE") => {
                self.pos += 1;
                Ok(Expr::Literal(Literal::Boolean(false)))
            },
            Some(Token::Ident(word)) if word.eq_ignore_ascii_case("EXISTS") => {
                self.pos += 1;
                self.expect(&Token::LParen)?;
                let subquery = self.query()?;
                self.expect(&Token::RParen)?;
                Ok(Expr::Exists {
                    subquery: Box::new(subquery),
                    negated: false,
                })
            },
            Some(Token::Ident(word)) => {
                // Function call?
                if self.peek_at(1) == Some(&Token::LParen) {
                    self.pos += 2;
                    return self.function_call(word);
                }
                self.pos += 1;
                self.column_ref(word)
            },
            Some(Token::Quoted(word)) => {
                self.pos += 1;
                self.column_ref(word)
            },
            other => Err(self.error(format!("unexpected token {other:?} in expression"))),
        }
    }

    fn column_ref(&mut self, first: String) -> Result<Expr, ParseError> {
        if self.eat(&Token::Dot) {
            let name = self.identifier()?;
            return Ok(Expr::Column(ColumnRef {
                table: Some(first),
                name,
            }));
        }
        Ok(Expr::Column(ColumnRef {
            table: None,
            name: first,
        }))
    }

    fn function_call(&mut self, name: String) -> Result<Expr, ParseError> {
        if self.eat(&Token::Star) {
            self.expect(&Token::RParen)?;
            return Ok(Expr::Function {
                name,
                args: Vec::new(),
                star: true,
                distinct: false,
            });
        }
        let distinct = self.eat_keyword("DISTINCT");
        let mut args = Vec::new();
        if !self.eat(&Token::RParen) {
            loop {
                args.push(self.expr()?);
                if !self.eat(&Token::Comma) {
                    break;
                }
            }
            self.expect(&Token::RParen)?;
        }
        Ok(Expr::Function {
            name,
            args,
            star: false,
            distinct,
        })
    }
}

fn is_reserved(word: &str) -> bool {
    RESERVED.iter().any(|r| r.eq_ignore_ascii_case(word))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn select(input: &str) -> Query {
        match parse_statement(input).unwrap() {
            Statement::Select(q) => q,
            other => panic!("expected select, got {other:?}"),
        }
    }

    #[test]
    fn parses_qualified_columns_and_aliases() {
        let q = select("SELECT u.name AS n, age FROM users u");
        assert_eq!(q.first.projection.len(), 2);
        assert_eq!(
            q.first.projection[0],
            SelectItem::Expr {
                expr: Expr::Column(ColumnRef {
                    table: Some("u".into()),
                    name: "name".into()
                }),
                alias: Some("n".into()),
            }
        );
        let from = q.first.from.unwrap();
        assert_eq!(
            from.first,
            TableFactor::Table(TableRef {
                name: "users".into(),
                alias: Some("u".into()),
            })
        );
    }

    #[test]
    fn parses_joins() {
        let q = select(
            "SELECT * FROM a INNER JOIN b ON a.id = b.a_id LEFT OUTER JOIN c ON c.x = b.x, d",
        );
        let from = q.first.from.unwrap();
        assert_eq!(from.joins.len(), 3);
        assert_eq!(from.joins[0].kind, JoinKind::Inner);
        assert_eq!(from.joins[1].kind, JoinKind::Left);
        assert_eq!(from.joins[2].kind, JoinKind::Cross);
        assert!(from.joins[2].on.is_none());
    }

    #[test]
    fn parses_cte_and_compound() {
        let q = select(
            "WITH RECURSIVE nums AS (SELECT 1) SELECT * FROM nums UNION ALL SELECT 2 \
             ORDER BY 1 LIMIT 10 OFFSET 5",
        );
        let with = q.with.as_ref().unwrap();
        assert!(with.recursive);
        assert_eq!(with.ctes[0].name, "nums");
        assert_eq!(q.compounds.len(), 1);
        assert_eq!(q.compounds[0].0, SetOp::UnionAll);
        assert!(q.limit.is_some());
        assert!(q.offset.is_some());
    }

    #[test]
    fn numbers_unnumbered_params_like_sqlite() {
        let q = select("SELECT * FROM t WHERE a = ? AND b = ?5 AND c = ?");
        let where_clause = q.first.where_clause.unwrap();
        let mut params = Vec::new();
        collect_params(&where_clause, &mut params);
        assert_eq!(params, vec![0, 4, 5]);
    }

    fn collect_params(expr: &Expr, out: &mut Vec<usize>) {
        match expr {
            Expr::Param(i) => out.push(*i),
            Expr::Binary { lhs, rhs, .. } => {
                collect_params(lhs, out);
                collect_params(rhs, out);
            },
            Expr::Nested(e) | Expr::Not(e) | Expr::Neg(e) => collect_params(e, out),
            _ => {},
        }
    }

    #[test]
    fn parses_in_between_exists() {
        let q = select(
            "SELECT * FROM t WHERE a IN (1, 2) AND b NOT IN (SELECT id FROM s) \
             AND c BETWEEN 1 AND 10 AND NOT EXISTS (SELECT 1 FROM u) AND d IS NOT NULL",
        );
        assert!(q.first.where_clause.is_some());
    }

    #[test]
    fn parses_insert_forms() {
        let s = parse_statement(
            "INSERT INTO users (id, name) VALUES (?, ?), (?, ?) RETURNING id",
        )
        .unwrap();
        match s {
            Statement::Insert(insert) => {
                assert_eq!(insert.table.name, "users");
                assert_eq!(insert.columns, vec!["id".to_string(), "name".to_string()]);
                match insert.source {
                    InsertSource::Values(rows) => assert_eq!(rows.len(), 2),
                    other => panic!("expected values, got {other:?}"),
                }
                assert_eq!(insert.returning.len(), 1);
            },
            other => panic!("expected insert, got {other:?}"),
        }

        let s = parse_statement("INSERT OR REPLACE INTO t SELECT * FROM s").unwrap();
        assert!(matches!(
            s,
            Statement::Insert(InsertStatement {
                source: InsertSource::Select(_),
                ..
            })
        ));
    }

    #[test]
    fn parses_update_with_from() {
        let s = parse_statement(
            "UPDATE t SET a = ?, b = b + 1 FROM s WHERE t.id = s.t_id RETURNING *",
        )
        .unwrap();
        match s {
            Statement::Update(update) => {
                assert_eq!(update.assignments.len(), 2);
                assert!(update.from.is_some());
                assert!(update.where_clause.is_some());
            },
            other => panic!("expected update, got {other:?}"),
        }
    }

    #[test]
    fn parses_delete_with_using() {
        let s = parse_statement("DELETE FROM t USING s WHERE t.id = s.t_id").unwrap();
        match s {
            Statement::Delete(delete) => {
                assert_eq!(delete.table.name, "t");
                assert!(delete.using.is_some());
            },
            other => panic!("expected delete, got {other:?}"),
        }
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_statement("SELEC 1").is_err());
        assert!(parse_statement("SELECT FROM WHERE").is_err());
        assert!(parse_statement("SELECT 1 extra garbage !").is_err());
    }

    #[test]
    fn parses_derived_table() {
        let q = select("SELECT x FROM (SELECT a AS x FROM t) sub WHERE x > 1");
        let from = q.first.from.unwrap();
        assert!(matches!(
            from.first,
            TableFactor::Derived {
                alias: Some(ref a),
                ..
            } if a == "sub"
        ));
    }
}
