use std::collections::BTreeMap;

use serde_yaml::Value;
use thiserror::Error;

use crate::platform::Platform;

#[derive(Debug, Error, PartialEq)]
pub(crate) enum Error {
    #[error("Unexpected character `{0}` in expression")]
    UnexpectedChar(char),
    #[error("Unexpected end of expression")]
    UnexpectedEnd,
    #[error("Unexpected token `{0}`")]
    UnexpectedToken(String),
    #[error("Unknown variable `{0}`")]
    UnknownVariable(String),
    #[error("Unterminated `{{{{` in template")]
    UnterminatedPlaceholder,
}

/// Innermost-wins scope stack: step vars, then `spec.variables`, then
/// `spec.environment`, then platform attributes.
pub(crate) struct Scope<'a> {
    layers: Vec<&'a BTreeMap<String, Value>>,
    platform: BTreeMap<String, Value>,
}

impl<'a> Scope<'a> {
    pub(crate) fn new(platform: &Platform) -> Self {
        let mut attrs = BTreeMap::new();
        attrs.insert("os".to_string(), Value::from(platform.os.as_str()));
        attrs.insert("arch".to_string(), Value::from(platform.arch.as_str()));
        attrs.insert(
            "distro_family".to_string(),
            Value::from(platform.distro_family.as_str()),
        );
        attrs.insert("distro".to_string(), Value::from(platform.distro.clone()));
        attrs.insert("version".to_string(), Value::from(platform.version.clone()));
        attrs.insert(
            "inside_container".to_string(),
            Value::from(platform.inside_container),
        );
        Self {
            layers: Vec::new(),
            platform: attrs,
        }
    }

    /// Push an outer layer. Layers pushed later are consulted first.
    pub(crate) fn push(mut self, layer: &'a BTreeMap<String, Value>) -> Self {
        self.layers.push(layer);
        self
    }

    fn lookup(&self, name: &str) -> Option<&Value> {
        for layer in self.layers.iter().rev() {
            if let Some(value) = layer.get(name) {
                return Some(value);
            }
        }
        self.platform.get(name)
    }

    /// Whether `name` resolves in any layer, for validation.
    pub(crate) fn defines(&self, name: &str) -> bool {
        self.lookup(name).is_some()
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Number(f64),
    Bool(bool),
    Null,
    Eq,
    Ne,
    And,
    Or,
    Not,
    If,
    Else,
    Dot,
    LParen,
    RParen,
}

fn tokenize(input: &str) -> Result<Vec<Token>, Error> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '.' => {
                chars.next();
                tokens.push(Token::Dot);
            }
            '=' => {
                chars.next();
                if chars.next() == Some('=') {
                    tokens.push(Token::Eq);
                } else {
                    return Err(Error::UnexpectedChar('='));
                }
            }
            '!' => {
                chars.next();
                if chars.next() == Some('=') {
                    tokens.push(Token::Ne);
                } else {
                    return Err(Error::UnexpectedChar('!'));
                }
            }
            '\'' | '"' => {
                let quote = c;
                chars.next();
                let mut value = String::new();
                loop {
                    match chars.next() {
                        Some(c) if c == quote => break,
                        Some(c) => value.push(c),
                        None => return Err(Error::UnexpectedEnd),
                    }
                }
                tokens.push(Token::Str(value));
            }
            c if c.is_ascii_digit() => {
                let mut number = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_digit() || c == '.' {
                        number.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                // A trailing `.` belongs to a path, not a number.
                let number = number.trim_end_matches('.');
                tokens.push(Token::Number(
                    number.parse().map_err(|_| Error::UnexpectedToken(number.to_string()))?,
                ));
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut word = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_alphanumeric() || c == '_' || c == '-' {
                        word.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(match word.as_str() {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    "if" => Token::If,
                    "else" => Token::Else,
                    "true" => Token::Bool(true),
                    "false" => Token::Bool(false),
                    "null" => Token::Null,
                    _ => Token::Ident(word),
                });
            }
            c => return Err(Error::UnexpectedChar(c)),
        }
    }
    Ok(tokens)
}

/// A parsed expression: bare identifiers, dotted paths, equality, logical
/// operators, and the `A if cond else B` ternary.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Expr {
    Literal(Value),
    Path(Vec<String>),
    Eq(Box<Expr>, Box<Expr>),
    Ne(Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    Ternary {
        then: Box<Expr>,
        cond: Box<Expr>,
        otherwise: Box<Expr>,
    },
}

impl Expr {
    /// Root identifiers referenced by this expression, for validation.
    pub(crate) fn roots(&self) -> Vec<&str> {
        match self {
            Expr::Literal(_) => Vec::new(),
            Expr::Path(parts) => vec![parts[0].as_str()],
            Expr::Eq(a, b) | Expr::Ne(a, b) | Expr::And(a, b) | Expr::Or(a, b) => {
                let mut roots = a.roots();
                roots.extend(b.roots());
                roots
            }
            Expr::Not(inner) => inner.roots(),
            Expr::Ternary {
                then,
                cond,
                otherwise,
            } => {
                let mut roots = then.roots();
                roots.extend(cond.roots());
                roots.extend(otherwise.roots());
                roots
            }
        }
    }
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    // ternary := or ("if" or "else" ternary)?
    fn ternary(&mut self) -> Result<Expr, Error> {
        let value = self.or()?;
        if self.eat(&Token::If) {
            let cond = self.or()?;
            if !self.eat(&Token::Else) {
                return Err(Error::UnexpectedEnd);
            }
            let otherwise = self.ternary()?;
            return Ok(Expr::Ternary {
                then: Box::new(value),
                cond: Box::new(cond),
                otherwise: Box::new(otherwise),
            });
        }
        Ok(value)
    }

    fn or(&mut self) -> Result<Expr, Error> {
        let mut left = self.and()?;
        while self.eat(&Token::Or) {
            let right = self.and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<Expr, Error> {
        let mut left = self.not()?;
        while self.eat(&Token::And) {
            let right = self.not()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn not(&mut self) -> Result<Expr, Error> {
        if self.eat(&Token::Not) {
            return Ok(Expr::Not(Box::new(self.not()?)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr, Error> {
        let left = self.primary()?;
        if self.eat(&Token::Eq) {
            let right = self.primary()?;
            return Ok(Expr::Eq(Box::new(left), Box::new(right)));
        }
        if self.eat(&Token::Ne) {
            let right = self.primary()?;
            return Ok(Expr::Ne(Box::new(left), Box::new(right)));
        }
        Ok(left)
    }

    fn primary(&mut self) -> Result<Expr, Error> {
        match self.next().ok_or(Error::UnexpectedEnd)? {
            Token::Str(value) => Ok(Expr::Literal(Value::from(value))),
            Token::Number(value) => Ok(Expr::Literal(Value::from(value))),
            Token::Bool(value) => Ok(Expr::Literal(Value::from(value))),
            Token::Null => Ok(Expr::Literal(Value::Null)),
            Token::LParen => {
                let inner = self.ternary()?;
                if !self.eat(&Token::RParen) {
                    return Err(Error::UnexpectedEnd);
                }
                Ok(inner)
            }
            Token::Ident(first) => {
                let mut parts = vec![first];
                while self.eat(&Token::Dot) {
                    match self.next() {
                        Some(Token::Ident(part)) => parts.push(part),
                        _ => return Err(Error::UnexpectedEnd),
                    }
                }
                Ok(Expr::Path(parts))
            }
            token => Err(Error::UnexpectedToken(format!("{token:?}"))),
        }
    }
}

/// Parse an expression without evaluating it.
pub(crate) fn parse(input: &str) -> Result<Expr, Error> {
    let tokens = tokenize(input)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.ternary()?;
    if parser.pos != parser.tokens.len() {
        return Err(Error::UnexpectedToken(format!("{:?}", parser.tokens[parser.pos])));
    }
    Ok(expr)
}

/// Evaluate an expression against a scope. Pure: no side effects.
pub(crate) fn eval(expr: &Expr, scope: &Scope<'_>) -> Result<Value, Error> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Path(parts) => {
            let mut current = scope
                .lookup(&parts[0])
                .ok_or_else(|| Error::UnknownVariable(parts[0].clone()))?
                .clone();
            for part in &parts[1..] {
                current = match current {
                    Value::Mapping(mapping) => mapping
                        .get(part.as_str())
                        .cloned()
                        .unwrap_or(Value::Null),
                    _ => Value::Null,
                };
            }
            Ok(current)
        }
        Expr::Eq(a, b) => Ok(Value::from(eval(a, scope)? == eval(b, scope)?)),
        Expr::Ne(a, b) => Ok(Value::from(eval(a, scope)? != eval(b, scope)?)),
        Expr::And(a, b) => {
            Ok(Value::from(truthy(&eval(a, scope)?) && truthy(&eval(b, scope)?)))
        }
        Expr::Or(a, b) => Ok(Value::from(truthy(&eval(a, scope)?) || truthy(&eval(b, scope)?))),
        Expr::Not(inner) => Ok(Value::from(!truthy(&eval(inner, scope)?))),
        Expr::Ternary {
            then,
            cond,
            otherwise,
        } => {
            if truthy(&eval(cond, scope)?) {
                eval(then, scope)
            } else {
                eval(otherwise, scope)
            }
        }
    }
}

/// Evaluate a `when` guard: parse, evaluate, coerce to bool.
pub(crate) fn eval_condition(input: &str, scope: &Scope<'_>) -> Result<bool, Error> {
    Ok(truthy(&eval(&parse(input)?, scope)?))
}

pub(crate) fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(value) => *value,
        Value::Number(value) => value.as_f64().unwrap_or(0.0) != 0.0,
        Value::String(value) => !value.is_empty(),
        Value::Sequence(value) => !value.is_empty(),
        Value::Mapping(value) => !value.is_empty(),
        Value::Tagged(tagged) => truthy(&tagged.value),
    }
}

fn render_value(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(value) => value.to_string(),
        Value::Number(value) => value.to_string(),
        Value::String(value) => value.clone(),
        other => serde_yaml::to_string(other)
            .unwrap_or_default()
            .trim_end()
            .to_string(),
    }
}

/// Expand every `{{ expr }}` placeholder in a string. Runs on every string
/// field before execution.
pub(crate) fn render(input: &str, scope: &Scope<'_>) -> Result<String, Error> {
    let mut output = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("{{") {
        output.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            return Err(Error::UnterminatedPlaceholder);
        };
        let expr = parse(after[..end].trim())?;
        output.push_str(&render_value(&eval(&expr, scope)?));
        rest = &after[end + 2..];
    }
    output.push_str(rest);
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{Arch, DistroFamily, Os};
    use pretty_assertions::assert_eq;

    fn platform() -> Platform {
        Platform {
            os: Os::Linux,
            arch: Arch::Amd64,
            distro_family: DistroFamily::Apt,
            distro: "ubuntu".into(),
            version: "22.04".into(),
            inside_container: false,
        }
    }

    fn vars(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
        pairs
            .iter()
            .map(|(name, value)| ((*name).to_string(), value.clone()))
            .collect()
    }

    #[test]
    fn bare_identifiers_and_literals() {
        let platform = platform();
        let vars = vars(&[
            ("install_java", Value::from(true)),
            ("install_node", Value::from(false)),
            ("count", Value::from(3)),
        ]);
        let scope = Scope::new(&platform).push(&vars);

        assert!(eval_condition("install_java", &scope).unwrap());
        assert!(!eval_condition("install_node", &scope).unwrap());
        assert!(eval_condition("count", &scope).unwrap());
        assert!(eval_condition("true", &scope).unwrap());
        assert!(!eval_condition("false", &scope).unwrap());
    }

    #[test]
    fn equality_and_logic() {
        let platform = platform();
        let scope = Scope::new(&platform);

        assert!(eval_condition("os == 'linux'", &scope).unwrap());
        assert!(eval_condition("os != 'darwin'", &scope).unwrap());
        assert!(eval_condition("os == 'linux' and arch == 'amd64'", &scope).unwrap());
        assert!(eval_condition("os == 'darwin' or arch == 'amd64'", &scope).unwrap());
        assert!(eval_condition("not inside_container", &scope).unwrap());
        assert!(eval_condition("not (os == 'darwin')", &scope).unwrap());
    }

    #[test]
    fn ternary_expression() {
        let platform = platform();
        let vars = vars(&[("fast", Value::from(true))]);
        let scope = Scope::new(&platform).push(&vars);

        let expr = parse("'quick' if fast else 'slow'").unwrap();
        assert_eq!(eval(&expr, &scope).unwrap(), Value::from("quick"));

        let expr = parse("'quick' if not fast else 'slow'").unwrap();
        assert_eq!(eval(&expr, &scope).unwrap(), Value::from("slow"));
    }

    #[test]
    fn dotted_paths_traverse_mappings() {
        let platform = platform();
        let nested: Value = serde_yaml::from_str("java:\n  version: 21\n").unwrap();
        let vars = vars(&[("config", nested)]);
        let scope = Scope::new(&platform).push(&vars);

        let expr = parse("config.java.version").unwrap();
        assert_eq!(eval(&expr, &scope).unwrap(), Value::from(21));

        // Missing leaves are null, not errors.
        let expr = parse("config.java.vendor").unwrap();
        assert_eq!(eval(&expr, &scope).unwrap(), Value::Null);
    }

    #[test]
    fn innermost_scope_wins() {
        let platform = platform();
        let outer = vars(&[("level", Value::from("outer"))]);
        let inner = vars(&[("level", Value::from("inner"))]);
        let scope = Scope::new(&platform).push(&outer).push(&inner);

        let expr = parse("level").unwrap();
        assert_eq!(eval(&expr, &scope).unwrap(), Value::from("inner"));
    }

    #[test]
    fn unknown_variables_error() {
        let platform = platform();
        let scope = Scope::new(&platform);
        assert_eq!(
            eval_condition("no_such_var", &scope),
            Err(Error::UnknownVariable("no_such_var".into()))
        );
    }

    #[test]
    fn template_rendering() {
        let platform = platform();
        let vars = vars(&[("app", Value::from("hugo")), ("fast", Value::from(true))]);
        let scope = Scope::new(&platform).push(&vars);

        assert_eq!(
            render("install {{ app }} on {{ os }}/{{ arch }}", &scope).unwrap(),
            "install hugo on linux/amd64"
        );
        assert_eq!(
            render("mode={{ 'quick' if fast else 'slow' }}", &scope).unwrap(),
            "mode=quick"
        );
        assert_eq!(render("no placeholders", &scope).unwrap(), "no placeholders");
        assert_eq!(
            render("{{ app }}{{ app }}", &scope).unwrap(),
            "hugohugo"
        );
        assert!(render("{{ app", &scope).is_err());
    }

    #[test]
    fn parse_errors_are_reported() {
        assert!(parse("==").is_err());
        assert!(parse("a ==").is_err());
        assert!(parse("(a").is_err());
        assert!(parse("a b").is_err());
        assert!(parse("a = b").is_err());
    }

    #[test]
    fn expression_roots_for_validation() {
        let expr = parse("config.java.version == target and enabled").unwrap();
        let mut roots = expr.roots();
        roots.sort_unstable();
        assert_eq!(roots, ["config", "enabled", "target"]);
    }
}
