/// parse task document with structure like
/// ```text
/// problem
///   name: VanDerPol
///   epsilon: 1e-2
/// method
///   name: DOPR54
/// ```
/// into HashMap<title, HashMap<key, Vec<Value>>> and give typed access to the sections.
/// Comment lines start with //, # or %.
use crate::numerical::stepper_error::{Result, StepperError};
use nom::{
    IResult, Parser,
    branch::alt,
    bytes::complete::{tag, take_while1},
    character::complete::{alpha1, alphanumeric1, multispace0, space0},
    combinator::{map, recognize},
    multi::{many0, many1, separated_list1},
    sequence::{delimited, pair, separated_pair, terminated},
};
use std::collections::HashMap;
use std::fmt::Display;
use std::fs;
use std::path::Path;

pub type SectionMap = HashMap<String, Vec<Value>>;
pub type DocumentMap = HashMap<String, SectionMap>;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    String(String),
    Float(f64),
    Integer(i64),
    Boolean(bool),
}

impl Value {
    pub fn as_string(&self) -> Option<&String> {
        if let Value::String(s) = self {
            Some(s)
        } else {
            None
        }
    }
    /// integers are accepted where floats are expected
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        if let Value::Integer(i) = self {
            Some(*i)
        } else {
            None
        }
    }
    /// 0/1 flags are accepted as booleans
    pub fn as_boolean(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            Value::Integer(0) => Some(false),
            Value::Integer(1) => Some(true),
            _ => None,
        }
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::String(s) => write!(f, "{}", s),
            Value::Float(val) => write!(f, "{:e}", val),
            Value::Integer(val) => write!(f, "{}", val),
            Value::Boolean(val) => write!(f, "{}", val),
        }
    }
}

fn identifier(input: &str) -> IResult<&str, String> {
    let parser = recognize(pair(
        alt((alpha1, tag("_"))),
        many0(alt((alphanumeric1, tag("_")))),
    ));
    let mut parser = map(parser, String::from);
    parser.parse(input)
}

/// Parses a title (word characters without spaces)
fn parse_title(input: &str) -> IResult<&str, String> {
    let (input, result) = identifier(input)?;
    Ok((input.trim_start(), result))
}

fn parse_key(input: &str) -> IResult<&str, String> {
    identifier(input)
}

fn parse_value(input: &str) -> IResult<&str, Value> {
    let mut value_parser = map(
        take_while1(|c: char| !matches!(c, ',' | ' ' | '\t' | '\r' | '\n' | ';')),
        |s: &str| {
            if let Ok(val) = s.parse::<i64>() {
                Value::Integer(val)
            } else if let Ok(val) = s.parse::<f64>() {
                Value::Float(val)
            } else if let Ok(val) = s.parse::<bool>() {
                Value::Boolean(val)
            } else {
                Value::String(s.to_string())
            }
        },
    );
    value_parser.parse(input)
}

fn parse_value_list(input: &str) -> IResult<&str, Vec<Value>> {
    let (input, _) = space0(input)?;
    let separator_coma = delimited(space0, tag(","), space0);
    let mut value_parser = separated_list1(separator_coma, parse_value);
    value_parser.parse(input)
}

fn parse_key_value_pair(input: &str) -> IResult<&str, (String, Vec<Value>)> {
    let colon_separator = delimited(space0, tag(":"), space0);
    let mut parser = separated_pair(parse_key, colon_separator, parse_value_list);
    let (input, result) = parser.parse(input)?;
    Ok((input.trim_start(), result))
}

fn parse_section(input: &str) -> IResult<&str, (String, SectionMap)> {
    let (input, _) = space0(input)?;
    let (input, title) = parse_title(input)?;
    let (input, _) = multispace0(input)?;
    let mut parser = many1(terminated(parse_key_value_pair, space0));
    let (input, pairs) = parser.parse(input)?;
    let section_map: SectionMap = pairs.into_iter().collect();
    Ok((input, (title, section_map)))
}

fn strip_comments(input: &str) -> String {
    input
        .lines()
        .filter(|line| {
            let trimmed = line.trim();
            !trimmed.starts_with("//")
                && !trimmed.starts_with('#')
                && !trimmed.starts_with('%')
                && !trimmed.is_empty()
        })
        .collect::<Vec<&str>>()
        .join("\n")
}

fn parse_sections(input: &str) -> IResult<&str, Vec<(String, SectionMap)>> {
    let mut parser = many1(delimited(multispace0, parse_section, multispace0));
    parser.parse(input)
}

/// parse the whole document; a section title that appears twice merges its keys
pub fn parse_document(input: &str) -> Result<DocumentMap> {
    let filtered = strip_comments(input);
    let (remaining, sections) =
        parse_sections(&filtered).map_err(|e| StepperError::Parse(format!("{:?}", e)))?;
    if !remaining.trim().is_empty() {
        return Err(StepperError::Parse(format!(
            "failed to parse entire document, remaining: '{}'",
            remaining
        )));
    }
    let mut result: DocumentMap = HashMap::new();
    for (title, section_map) in sections {
        result.entry(title).or_default().extend(section_map);
    }
    Ok(result)
}

pub fn parse_document_file<P: AsRef<Path>>(path: P) -> Result<DocumentMap> {
    let content = fs::read_to_string(path)?;
    parse_document(&content)
}

/// typed read-only view of one section; a missing section behaves as an empty one
pub struct TaskSection<'a> {
    title: &'a str,
    map: Option<&'a SectionMap>,
}

impl<'a> TaskSection<'a> {
    pub fn new(document: &'a DocumentMap, title: &'a str) -> TaskSection<'a> {
        TaskSection {
            title,
            map: document.get(title),
        }
    }

    pub fn from_map(title: &'a str, map: &'a SectionMap) -> TaskSection<'a> {
        TaskSection {
            title,
            map: Some(map),
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.map.is_some_and(|m| m.contains_key(key))
    }

    fn first(&self, key: &str) -> Option<&'a Value> {
        self.map.and_then(|m| m.get(key)).and_then(|v| v.first())
    }

    fn bad_type(&self, key: &str, expected: &str) -> StepperError {
        StepperError::Configuration(format!(
            "{}.{} must be {}",
            self.title, key, expected
        ))
    }

    pub fn f64_or(&self, key: &str, default: f64) -> Result<f64> {
        match self.first(key) {
            None => Ok(default),
            Some(v) => v.as_float().ok_or_else(|| self.bad_type(key, "a number")),
        }
    }

    pub fn require_f64(&self, key: &str) -> Result<f64> {
        self.first(key)
            .ok_or_else(|| StepperError::Configuration(format!("{}.{} is required", self.title, key)))?
            .as_float()
            .ok_or_else(|| self.bad_type(key, "a number"))
    }

    pub fn usize_or(&self, key: &str, default: usize) -> Result<usize> {
        match self.first(key) {
            None => Ok(default),
            Some(v) => v
                .as_integer()
                .filter(|i| *i >= 0)
                .map(|i| i as usize)
                .ok_or_else(|| self.bad_type(key, "a non-negative integer")),
        }
    }

    pub fn i64_or(&self, key: &str, default: i64) -> Result<i64> {
        match self.first(key) {
            None => Ok(default),
            Some(v) => v.as_integer().ok_or_else(|| self.bad_type(key, "an integer")),
        }
    }

    pub fn bool_or(&self, key: &str, default: bool) -> Result<bool> {
        match self.first(key) {
            None => Ok(default),
            Some(v) => v.as_boolean().ok_or_else(|| self.bad_type(key, "a boolean")),
        }
    }

    pub fn string(&self, key: &str) -> Option<String> {
        self.first(key).map(|v| v.to_string())
    }

    pub fn string_or(&self, key: &str, default: &str) -> String {
        self.string(key).unwrap_or_else(|| default.to_string())
    }

    pub fn require_string(&self, key: &str) -> Result<String> {
        self.string(key)
            .ok_or_else(|| StepperError::Configuration(format!("{}.{} is required", self.title, key)))
    }

    /// flattened `title.key -> value` pairs, used for the run summary
    pub fn entries(&self) -> Vec<(String, String)> {
        let mut out = Vec::new();
        if let Some(map) = self.map {
            for (key, values) in map {
                let joined = values
                    .iter()
                    .map(|v| v.to_string())
                    .collect::<Vec<_>>()
                    .join(", ");
                out.push((format!("{} {}", self.title, key), joined));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn test_parse_title_and_key() {
        let (remaining, title) = parse_title("problem\n name: VanDerPol").unwrap();
        assert_eq!(title, "problem");
        assert_eq!(remaining, "name: VanDerPol");

        let (remaining, key) = parse_key("newton_tol: 1e-8").unwrap();
        assert_eq!(key, "newton_tol");
        assert_eq!(remaining, ": 1e-8");
    }

    #[test]
    fn test_parse_value_types() {
        let (_, v) = parse_value("123, next").unwrap();
        assert_eq!(v, Value::Integer(123));
        let (_, v) = parse_value("1e-5").unwrap();
        assert_eq!(v, Value::Float(1e-5));
        let (_, v) = parse_value("-0.6654321").unwrap();
        assert_eq!(v, Value::Float(-0.6654321));
        let (_, v) = parse_value("true").unwrap();
        assert_eq!(v, Value::Boolean(true));
        let (_, v) = parse_value("out/run_1").unwrap();
        assert_eq!(v, Value::String("out/run_1".to_string()));
    }

    #[test]
    fn test_parse_key_value_pair_list() {
        let (remaining, (key, values)) = parse_key_value_pair("y0 : 2.0 , -0.5\nnext: 1").unwrap();
        assert_eq!(key, "y0");
        assert_eq!(values, vec![Value::Float(2.0), Value::Float(-0.5)]);
        assert_eq!(remaining, "next: 1");
        // a key needs at least one value
        assert!(parse_key_value_pair("path:\nname: x").is_err());
    }

    #[test]
    fn test_parse_document() {
        let input = "
        // run definition
        problem
          name: ExponentialDecay
        method
          name: ForwardEuler
          newton_tol: 1e-8
        # comment line
        solver
          name: ConstantSolver
          dt: 0.01
          tf: 1
          path: out
        ";
        let doc = parse_document(input).unwrap();
        assert_eq!(doc.len(), 3);
        let solver = TaskSection::new(&doc, "solver");
        assert_eq!(solver.require_string("name").unwrap(), "ConstantSolver");
        assert_eq!(solver.f64_or("dt", 1e-3).unwrap(), 0.01);
        assert_eq!(solver.require_f64("tf").unwrap(), 1.0);
        assert_eq!(solver.usize_or("max_steps", 100000).unwrap(), 100000);
        let method = TaskSection::new(&doc, "method");
        assert_eq!(method.f64_or("newton_tol", 0.0).unwrap(), 1e-8);
    }

    #[test]
    fn test_inline_section_and_flags() {
        let doc = parse_document("method name: RODAS elliptic: 1 sparse: 1").unwrap();
        let method = TaskSection::new(&doc, "method");
        assert_eq!(method.i64_or("elliptic", 0).unwrap(), 1);
        assert!(method.bool_or("sparse", false).unwrap());
        assert!(!TaskSection::new(&doc, "logging").contains("level"));
    }

    #[test]
    fn test_typed_access_errors() {
        let doc = parse_document("solver name: EmbeddedSolver rtol: tight").unwrap();
        let solver = TaskSection::new(&doc, "solver");
        assert!(matches!(solver.f64_or("rtol", 1e-5), Err(StepperError::Configuration(_))));
        assert!(matches!(solver.require_f64("tf"), Err(StepperError::Configuration(_))));
    }

    #[test]
    fn test_malformed_document() {
        assert!(matches!(parse_document("problem : :"), Err(StepperError::Parse(_))));
        assert!(parse_document("").is_err());
    }

    #[test]
    fn test_parse_document_from_file() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("task.txt");
        let mut file = File::create(&file_path).unwrap();
        writeln!(file, "problem\nname: VanDerPol\nepsilon: 0.001\nlogging\nlevel: debug").unwrap();
        let doc = parse_document_file(&file_path).unwrap();
        let problem = TaskSection::new(&doc, "problem");
        assert_eq!(problem.f64_or("epsilon", 0.01).unwrap(), 0.001);
        assert_eq!(TaskSection::new(&doc, "logging").string_or("level", "info"), "debug");
    }
}
