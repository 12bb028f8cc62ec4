//! Reader for the network's deploy definition (`deploy.prototxt`).
//!
//! Only the declared inputs are used: their names and `(N, C, H, W)` shapes.
//! Both the top-level `input` / `input_shape` / `input_dim` form and
//! `Input` layers are understood. Everything else in the file is skipped.

use std::fs;
use std::path::Path;

use candle_core::Shape;

use crate::error::{Error, Result};

/// A declared network input.
#[derive(Debug, Clone, PartialEq)]
pub struct InputDecl {
    pub name: String,
    pub shape: Shape,
}

/// The parts of a deploy definition the scorer needs.
#[derive(Debug, Clone, PartialEq)]
pub struct DeployDef {
    pub name: Option<String>,
    pub inputs: Vec<InputDecl>,
}

impl DeployDef {
    /// Read and parse a deploy definition from disk.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Deploy`] if the file cannot be read or declares no
    /// usable inputs.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let deploy_err = |reason: String| Error::Deploy {
            path: path.to_path_buf(),
            reason,
        };
        let text = fs::read_to_string(path).map_err(|e| deploy_err(e.to_string()))?;
        Self::parse(&text).map_err(deploy_err)
    }

    /// Parse deploy definition text.
    pub fn parse(text: &str) -> std::result::Result<Self, String> {
        let tokens = tokenize(text)?;
        let fields = Parser { tokens, pos: 0 }.message(false)?;

        let name = scalar(&fields, "name").map(str::to_string);

        let mut inputs = Vec::new();
        let names: Vec<&str> = scalars(&fields, "input").collect();
        let shapes: Vec<Vec<usize>> = messages(&fields, "input_shape")
            .map(|shape| dims(shape, "dim"))
            .collect::<std::result::Result<_, _>>()?;
        let legacy = dims(&fields, "input_dim")?;

        if !shapes.is_empty() {
            if shapes.len() != names.len() {
                let (names, shapes) = (names.len(), shapes.len());
                return Err(format!("{names} inputs but {shapes} input_shape blocks"));
            }
            for (name, shape) in names.iter().zip(shapes) {
                inputs.push(InputDecl {
                    name: name.to_string(),
                    shape: Shape::from(shape),
                });
            }
        } else if !names.is_empty() {
            if legacy.len() != 4 * names.len() {
                let (names, values) = (names.len(), legacy.len());
                return Err(format!("{names} inputs but {values} input_dim values"));
            }
            for (name, shape) in names.iter().zip(legacy.chunks(4)) {
                let shape = Shape::from(shape.to_vec());
                inputs.push(InputDecl {
                    name: name.to_string(),
                    shape,
                });
            }
        }

        for layer in messages(&fields, "layer") {
            if scalar(layer, "type") != Some("Input") {
                continue;
            }
            let shapes = messages(layer, "input_param")
                .flat_map(|param| messages(param, "shape"))
                .map(|shape| dims(shape, "dim"))
                .collect::<std::result::Result<Vec<_>, _>>()?;
            for (top, shape) in scalars(layer, "top").zip(shapes) {
                inputs.push(InputDecl {
                    name: top.to_string(),
                    shape: Shape::from(shape),
                });
            }
        }

        if inputs.is_empty() {
            return Err("no inputs declared".to_string());
        }
        Ok(Self { name, inputs })
    }

    pub fn input(&self, name: &str) -> Option<&InputDecl> {
        self.inputs.iter().find(|input| input.name == name)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Word(String),
    Colon,
    Open,
    Close,
}

#[derive(Debug, Clone, PartialEq)]
enum Value {
    Scalar(String),
    Message(Vec<(String, Value)>),
}

type Fields = Vec<(String, Value)>;

fn tokenize(text: &str) -> std::result::Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut chars = text.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '#' => {
                while chars.next_if(|&c| c != '\n').is_some() {}
            }
            ':' => {
                chars.next();
                tokens.push(Token::Colon);
            }
            '{' => {
                chars.next();
                tokens.push(Token::Open);
            }
            '}' => {
                chars.next();
                tokens.push(Token::Close);
            }
            '"' | '\'' => {
                chars.next();
                let mut word = String::new();
                loop {
                    match chars.next() {
                        Some(q) if q == c => break,
                        Some(ch) => word.push(ch),
                        None => return Err("unterminated string".to_string()),
                    }
                }
                tokens.push(Token::Word(word));
            }
            _ => {
                let mut word = String::new();
                let is_word = |&ch: &char| {
                    !ch.is_whitespace() && !matches!(ch, ':' | '{' | '}' | '#' | '"' | '\'')
                };
                while let Some(ch) = chars.next_if(is_word) {
                    word.push(ch);
                }
                tokens.push(Token::Word(word));
            }
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn message(&mut self, nested: bool) -> std::result::Result<Fields, String> {
        let mut fields = Vec::new();
        loop {
            let key = match self.next() {
                Some(Token::Word(key)) => key,
                Some(Token::Close) if nested => return Ok(fields),
                None if !nested => return Ok(fields),
                None => return Err("unexpected end of file".to_string()),
                Some(token) => return Err(format!("unexpected {token:?}")),
            };
            let value = match self.next() {
                Some(Token::Colon) => match self.next() {
                    Some(Token::Word(value)) => Value::Scalar(value),
                    Some(Token::Open) => Value::Message(self.message(true)?),
                    other => return Err(format!("expected a value for {key}, got {other:?}")),
                },
                Some(Token::Open) => Value::Message(self.message(true)?),
                other => return Err(format!("expected ':' or '{{' after {key}, got {other:?}")),
            };
            fields.push((key, value));
        }
    }
}

fn scalars<'a>(fields: &'a Fields, key: &'a str) -> impl Iterator<Item = &'a str> + 'a {
    fields.iter().filter_map(move |(k, v)| match v {
        Value::Scalar(s) if k == key => Some(s.as_str()),
        _ => None,
    })
}

fn scalar<'a>(fields: &'a Fields, key: &'a str) -> Option<&'a str> {
    scalars(fields, key).next()
}

fn messages<'a>(fields: &'a Fields, key: &'a str) -> impl Iterator<Item = &'a Fields> + 'a {
    fields.iter().filter_map(move |(k, v)| match v {
        Value::Message(m) if k == key => Some(m),
        _ => None,
    })
}

fn dims(fields: &Fields, key: &str) -> std::result::Result<Vec<usize>, String> {
    scalars(fields, key)
        .map(|d| d.parse::<usize>().map_err(|_| format!("invalid {key} value {d:?}")))
        .collect()
}
