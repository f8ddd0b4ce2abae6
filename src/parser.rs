use crate::diag::Diagnostic;
use crate::lexer::{SourceLine, Token};
use crate::schema::opcodes::Mnemonic;

/// Operand expression. The parser resolves no symbols and knows nothing
/// about fixed-point formats; the assembler owns all value semantics.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Int(i64),
    Real(f64),
    Symbol(String),
    Neg(Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    And,
    Or,
    Xor,
    Shl,
    Shr,
}

impl BinOp {
    /// Binding strength; higher binds tighter.
    fn precedence(self) -> u8 {
        match self {
            Self::Mul | Self::Div => 5,
            Self::Add | Self::Sub => 4,
            Self::Shl | Self::Shr => 3,
            Self::And => 2,
            Self::Xor => 1,
            Self::Or => 0,
        }
    }

    fn from_token(token: &Token) -> Option<Self> {
        Some(match token {
            Token::Plus => Self::Add,
            Token::Minus => Self::Sub,
            Token::Star => Self::Mul,
            Token::Slash => Self::Div,
            Token::Amp => Self::And,
            Token::Pipe => Self::Or,
            Token::Caret => Self::Xor,
            Token::Shl => Self::Shl,
            Token::Shr => Self::Shr,
            _ => return None,
        })
    }
}

/// One statement of a source line.
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    Equ { name: String, value: Expr },
    Mem { name: String, size: Expr },
    Label(String),
    Instruction { mnemonic: Mnemonic, operands: Vec<Expr> },
}

/// A parsed line: its number and the statements found on it (a label may
/// share a line with an instruction).
#[derive(Debug, Clone)]
pub struct ParsedLine {
    pub number: usize,
    pub statements: Vec<Statement>,
}

/// Parse tokenized lines into statements. Lines that fail to parse are
/// reported and dropped; the rest go through so one bad line does not
/// hide later problems.
pub fn parse(lines: &[SourceLine]) -> (Vec<ParsedLine>, Vec<Diagnostic>) {
    let mut parsed = Vec::new();
    let mut diagnostics = Vec::new();
    for line in lines {
        match parse_line(line) {
            Ok(statements) => parsed.push(ParsedLine {
                number: line.number,
                statements,
            }),
            Err(diagnostic) => diagnostics.push(diagnostic),
        }
    }
    (parsed, diagnostics)
}

fn parse_line(line: &SourceLine) -> Result<Vec<Statement>, Diagnostic> {
    let mut statements = Vec::new();
    let mut cursor = Cursor {
        tokens: &line.tokens,
        pos: 0,
        line: line.number,
    };
    while let Some(Token::Label(name)) = cursor.peek() {
        statements.push(Statement::Label(name.clone()));
        cursor.pos += 1;
    }
    if cursor.peek().is_none() {
        return Ok(statements);
    }
    statements.push(cursor.statement()?);
    if let Some(token) = cursor.peek() {
        return Err(cursor.unexpected(token.clone()));
    }
    Ok(statements)
}

struct Cursor<'t> {
    tokens: &'t [Token],
    pos: usize,
    line: usize,
}

impl Cursor<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<&Token> {
        let token = self.tokens.get(self.pos);
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn unexpected(&self, token: Token) -> Diagnostic {
        Diagnostic::error_at(self.line, format!("unexpected `{token:?}`"))
    }

    fn ident(&mut self, what: &str) -> Result<String, Diagnostic> {
        match self.next() {
            Some(Token::Ident(name)) => Ok(name.clone()),
            _ => Err(Diagnostic::error_at(self.line, format!("expected {what}"))),
        }
    }

    fn statement(&mut self) -> Result<Statement, Diagnostic> {
        let Some(Token::Ident(first)) = self.peek().cloned() else {
            return Err(Diagnostic::error_at(self.line, "expected a statement"));
        };
        self.pos += 1;

        // Directives come in both orders: `equ name value` and
        // `name equ value` (likewise for `mem`).
        match first.as_str() {
            "equ" => {
                let name = self.ident("a name after `equ`")?;
                let value = self.expr(0)?;
                return Ok(Statement::Equ { name, value });
            }
            "mem" => {
                let name = self.ident("a name after `mem`")?;
                let size = self.expr(0)?;
                return Ok(Statement::Mem { name, size });
            }
            _ => {}
        }
        if let Some(Token::Ident(second)) = self.peek() {
            match second.as_str() {
                "equ" => {
                    self.pos += 1;
                    let value = self.expr(0)?;
                    return Ok(Statement::Equ { name: first, value });
                }
                "mem" => {
                    self.pos += 1;
                    let size = self.expr(0)?;
                    return Ok(Statement::Mem { name: first, size });
                }
                _ => {}
            }
        }

        let Some(mnemonic) = Mnemonic::from_name(&first) else {
            return Err(Diagnostic::error_at(
                self.line,
                format!("unknown instruction `{first}`"),
            ));
        };
        let mut operands = Vec::new();
        if self.peek().is_some() {
            operands.push(self.expr(0)?);
            while self.peek() == Some(&Token::Comma) {
                self.pos += 1;
                operands.push(self.expr(0)?);
            }
        }
        Ok(Statement::Instruction { mnemonic, operands })
    }

    /// Precedence-climbing expression parser.
    fn expr(&mut self, min_precedence: u8) -> Result<Expr, Diagnostic> {
        let mut left = self.atom()?;
        while let Some(operator) = self.peek().and_then(BinOp::from_token) {
            if operator.precedence() < min_precedence {
                break;
            }
            self.pos += 1;
            let right = self.expr(operator.precedence() + 1)?;
            left = Expr::Binary(operator, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn atom(&mut self) -> Result<Expr, Diagnostic> {
        match self.next().cloned() {
            Some(Token::Int(value)) => Ok(Expr::Int(value)),
            Some(Token::Real(value)) => Ok(Expr::Real(value)),
            Some(Token::Ident(name)) => Ok(Expr::Symbol(name)),
            Some(Token::Minus) => Ok(Expr::Neg(Box::new(self.atom()?))),
            Some(Token::LParen) => {
                let inner = self.expr(0)?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(Diagnostic::error_at(self.line, "expected `)`")),
                }
            }
            Some(token) => Err(self.unexpected(token)),
            None => Err(Diagnostic::error_at(self.line, "expected an operand")),
        }
    }
}
