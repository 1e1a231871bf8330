//! Named-Value Script Context
//!
//! A minimal scripting runtime: values are JSON values, expressions are
//! sums and differences of literals and names, and statements are
//! assignments or bare expressions separated by `;` or newlines.
//!
//! ```text
//! count = count + 1; label = "run-" + count
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;
use serde_json::{Number, Value};

use super::{CompileMode, CompiledScript, ScriptContext, ScriptError};

#[derive(Debug, Clone, PartialEq)]
enum Term {
    Literal(Value),
    Name(String),
}

#[derive(Debug, Clone)]
struct Expr {
    first: Term,
    rest: Vec<(char, Term)>,
}

#[derive(Debug, Clone)]
enum Statement {
    Assign(String, Expr),
    Expr(Expr),
}

#[derive(Debug)]
struct Program {
    statements: Vec<Statement>,
}

type CompileCache = Arc<Mutex<HashMap<(CompileMode, String), CompiledScript>>>;

/// Thread-safe named-value store implementing [`ScriptContext`].
#[derive(Default)]
pub struct VariableContext {
    variables: Mutex<BTreeMap<String, Value>>,
    cache: CompileCache,
}

impl VariableContext {
    /// Creates an empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty context behind an `Arc`, ready to attach to a job.
    pub fn shared() -> Arc<dyn ScriptContext> {
        Arc::new(Self::new())
    }

    /// Number of distinct scripts compiled so far (shared with forks).
    pub fn compiled_count(&self) -> usize {
        self.cache.lock().len()
    }
}

fn evaluate(variables: &BTreeMap<String, Value>, expr: &Expr) -> Result<Value, ScriptError> {
    let mut acc = resolve(variables, &expr.first)?;
    for (op, term) in &expr.rest {
        let rhs = resolve(variables, term)?;
        acc = apply(*op, acc, rhs)?;
    }
    Ok(acc)
}

fn resolve(variables: &BTreeMap<String, Value>, term: &Term) -> Result<Value, ScriptError> {
    match term {
        Term::Literal(value) => Ok(value.clone()),
        Term::Name(name) => variables
            .get(name)
            .cloned()
            .ok_or_else(|| ScriptError::UndefinedName(name.clone())),
    }
}

impl ScriptContext for VariableContext {
    fn compile(&self, code: &str, mode: CompileMode) -> Result<CompiledScript, ScriptError> {
        let key = (mode, code.to_string());
        if let Some(script) = self.cache.lock().get(&key) {
            return Ok(script.clone());
        }

        let statements = match mode {
            CompileMode::Eval => vec![Statement::Expr(parse_expr(code.trim(), code)?)],
            CompileMode::Exec => split_outside_quotes(code, &[';', '\n'])
                .into_iter()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| parse_statement(s, code))
                .collect::<Result<Vec<_>, _>>()?,
        };

        debug!("Compiled {:?} script ({} statements)", mode, statements.len());

        let script = CompiledScript::new(code, mode, Arc::new(Program { statements }));
        self.cache.lock().insert(key, script.clone());
        Ok(script)
    }

    fn eval(&self, script: &CompiledScript) -> Result<Value, ScriptError> {
        let program = script
            .form()
            .downcast_ref::<Program>()
            .ok_or(ScriptError::ForeignScript)?;

        // One lock for the whole script so concurrent runs never interleave.
        let mut variables = self.variables.lock();
        let mut last = Value::Null;
        for statement in &program.statements {
            last = match statement {
                Statement::Assign(name, expr) => {
                    let value = evaluate(&variables, expr)?;
                    variables.insert(name.clone(), value.clone());
                    value
                }
                Statement::Expr(expr) => evaluate(&variables, expr)?,
            };
        }
        Ok(last)
    }

    fn set(&self, name: &str, value: Value) {
        self.variables.lock().insert(name.to_string(), value);
    }

    fn get(&self, name: &str) -> Option<Value> {
        self.variables.lock().get(name).cloned()
    }

    fn locals(&self) -> BTreeMap<String, Value> {
        self.variables.lock().clone()
    }

    fn fork(&self) -> Arc<dyn ScriptContext> {
        Arc::new(Self {
            variables: Mutex::new(self.variables.lock().clone()),
            cache: Arc::clone(&self.cache),
        })
    }
}

fn apply(op: char, lhs: Value, rhs: Value) -> Result<Value, ScriptError> {
    match (&lhs, &rhs) {
        (Value::Number(a), Value::Number(b)) => {
            if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
                let n = if op == '+' { x.checked_add(y) } else { x.checked_sub(y) };
                return n.map(Value::from).ok_or(ScriptError::Overflow { op });
            }
            let (x, y) = (a.as_f64().unwrap_or(0.0), b.as_f64().unwrap_or(0.0));
            let n = if op == '+' { x + y } else { x - y };
            Ok(Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null))
        }
        (Value::String(a), _) if op == '+' => Ok(Value::String(format!("{}{}", a, display(&rhs)))),
        (_, Value::String(b)) if op == '+' => Ok(Value::String(format!("{}{}", display(&lhs), b))),
        _ => Err(ScriptError::TypeMismatch {
            op,
            left: type_name(&lhs).to_string(),
            right: type_name(&rhs).to_string(),
        }),
    }
}

fn display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "map",
    }
}

fn syntax(code: &str, message: impl Into<String>) -> ScriptError {
    ScriptError::Syntax {
        code: code.to_string(),
        message: message.into(),
    }
}

fn parse_statement(text: &str, code: &str) -> Result<Statement, ScriptError> {
    if let Some(pos) = assignment_position(text) {
        let name = text[..pos].trim();
        if !is_identifier(name) {
            return Err(syntax(code, format!("cannot assign to '{}'", name)));
        }
        let expr = parse_expr(text[pos + 1..].trim(), code)?;
        return Ok(Statement::Assign(name.to_string(), expr));
    }
    Ok(Statement::Expr(parse_expr(text, code)?))
}

/// Position of a lone `=` outside string literals, if any.
fn assignment_position(text: &str) -> Option<usize> {
    let bytes = text.as_bytes();
    let mut in_quotes = false;
    for (i, &b) in bytes.iter().enumerate() {
        match b {
            b'"' if i == 0 || bytes[i - 1] != b'\\' => in_quotes = !in_quotes,
            b'=' if !in_quotes => {
                let prev = if i > 0 { bytes[i - 1] } else { b' ' };
                let next = bytes.get(i + 1).copied().unwrap_or(b' ');
                if prev != b'=' && prev != b'!' && next != b'=' {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

fn parse_expr(text: &str, code: &str) -> Result<Expr, ScriptError> {
    if text.is_empty() {
        return Err(syntax(code, "empty expression"));
    }
    if let Ok(value) = serde_json::from_str::<Value>(text) {
        return Ok(Expr {
            first: Term::Literal(value),
            rest: Vec::new(),
        });
    }

    let mut terms = Vec::new();
    let mut ops = Vec::new();
    let mut start = 0;
    let mut in_quotes = false;
    let bytes = text.as_bytes();
    for (i, &b) in bytes.iter().enumerate() {
        match b {
            b'"' if i == 0 || bytes[i - 1] != b'\\' => in_quotes = !in_quotes,
            b'+' | b'-' if !in_quotes && i > start && !is_exponent(&text[start..i]) => {
                terms.push(parse_term(text[start..i].trim(), code)?);
                ops.push(b as char);
                start = i + 1;
            }
            _ => {}
        }
    }
    if in_quotes {
        return Err(syntax(code, "unterminated string literal"));
    }
    terms.push(parse_term(text[start..].trim(), code)?);

    let mut iter = terms.into_iter();
    let first = iter.next().ok_or_else(|| syntax(code, "empty expression"))?;
    Ok(Expr {
        first,
        rest: ops.into_iter().zip(iter).collect(),
    })
}

/// True for a numeric prefix such as `1e` whose sign belongs to the exponent.
fn is_exponent(prefix: &str) -> bool {
    let p = prefix.trim();
    (p.ends_with('e') || p.ends_with('E'))
        && p.len() > 1
        && p[..p.len() - 1].chars().all(|c| c.is_ascii_digit() || c == '.')
}

fn parse_term(text: &str, code: &str) -> Result<Term, ScriptError> {
    if text.is_empty() {
        return Err(syntax(code, "missing operand"));
    }
    if let Ok(value) = serde_json::from_str::<Value>(text) {
        return Ok(Term::Literal(value));
    }
    if is_identifier(text) {
        return Ok(Term::Name(text.to_string()));
    }
    Err(syntax(code, format!("unexpected token '{}'", text)))
}

fn is_identifier(text: &str) -> bool {
    let mut chars = text.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn split_outside_quotes<'a>(text: &'a str, separators: &[char]) -> Vec<&'a str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut in_quotes = false;
    let mut prev = '\0';
    for (i, c) in text.char_indices() {
        if c == '"' && prev != '\\' {
            in_quotes = !in_quotes;
        } else if !in_quotes && separators.contains(&c) {
            parts.push(&text[start..i]);
            start = i + c.len_utf8();
        }
        prev = c;
    }
    parts.push(&text[start..]);
    parts
}
