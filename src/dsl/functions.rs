//! Built-in function library for the expression language.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use md5::Md5;
use rand::Rng;
use regex::Regex;
use sha1::Sha1;
use sha2::{Digest, Sha256};

use super::value::Value;
use crate::error::EvalError;

/// Names the evaluator dispatches on; compile-time expression checks
/// reject calls to anything else.
pub const BUILTIN_FUNCTIONS: &[&str] = &[
    "len",
    "contains",
    "contains_any",
    "starts_with",
    "ends_with",
    "to_lower",
    "to_upper",
    "trim",
    "trim_space",
    "regex",
    "regex_all",
    "base64",
    "base64_decode",
    "hex_encode",
    "hex_decode",
    "md5",
    "sha1",
    "sha256",
    "url_encode",
    "url_decode",
    "concat",
    "rand_int",
    "rand_base",
    "to_string",
    "to_number",
    "replace",
    "split",
    "join",
    "substr",
];

pub fn is_builtin(name: &str) -> bool {
    BUILTIN_FUNCTIONS.contains(&name)
}

/// Dispatches a function call by name.
pub fn call(name: &str, args: &[Value]) -> Result<Value, EvalError> {
    match name {
        "len" => len(args),
        "contains" => contains(args),
        "contains_any" => contains_any(args),
        "starts_with" => starts_with(args),
        "ends_with" => ends_with(args),
        "to_lower" => map_str(args, "to_lower", |s| s.to_lowercase()),
        "to_upper" => map_str(args, "to_upper", |s| s.to_uppercase()),
        "trim" => trim(args),
        "trim_space" => map_str(args, "trim_space", |s| s.trim().to_string()),
        "regex" => regex_match(args),
        "regex_all" => regex_all(args),
        "base64" => map_str(args, "base64", |s| STANDARD.encode(s.as_bytes())),
        "base64_decode" => base64_decode(args),
        "hex_encode" => map_str(args, "hex_encode", |s| hex_encode(s.as_bytes())),
        "hex_decode" => hex_decode_fn(args),
        "md5" => map_str(args, "md5", |s| hex_encode(&Md5::digest(s.as_bytes()))),
        "sha1" => map_str(args, "sha1", |s| hex_encode(&Sha1::digest(s.as_bytes()))),
        "sha256" => map_str(args, "sha256", |s| hex_encode(&Sha256::digest(s.as_bytes()))),
        "url_encode" => map_str(args, "url_encode", |s| {
            urlencoding::encode(&s).into_owned()
        }),
        "url_decode" => url_decode(args),
        "concat" => concat(args),
        "rand_int" => rand_int(args),
        "rand_base" => rand_base(args),
        "to_string" => exactly(args, 1, "to_string").map(|v| Value::String(v[0].to_string())),
        "to_number" => to_number(args),
        "replace" => replace(args),
        "split" => split(args),
        "join" => join(args),
        "substr" => substr(args),
        other => Err(EvalError::UnknownFunction(other.to_string())),
    }
}

fn exactly<'a>(
    args: &'a [Value],
    n: usize,
    function: &'static str,
) -> Result<&'a [Value], EvalError> {
    if args.len() != n {
        return Err(EvalError::Arity {
            function,
            expected: match n {
                1 => "1",
                2 => "2",
                3 => "3",
                _ => "more",
            },
            got: args.len(),
        });
    }
    Ok(args)
}

fn str_arg(value: &Value, function: &'static str) -> Result<String, EvalError> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Bytes(b) => Ok(String::from_utf8_lossy(b).into_owned()),
        Value::Int(_) | Value::Float(_) | Value::Bool(_) => Ok(value.to_string()),
        other => Err(EvalError::Type(format!(
            "{}: expected a string, got {:?}",
            function, other
        ))),
    }
}

fn map_str(
    args: &[Value],
    function: &'static str,
    f: impl Fn(String) -> String,
) -> Result<Value, EvalError> {
    let args = exactly(args, 1, function)?;
    Ok(Value::String(f(str_arg(&args[0], function)?)))
}

fn len(args: &[Value]) -> Result<Value, EvalError> {
    let args = exactly(args, 1, "len")?;
    let n = match &args[0] {
        Value::String(s) => s.len(),
        Value::Bytes(b) => b.len(),
        Value::List(l) => l.len(),
        Value::Map(m) => m.len(),
        Value::Null => 0,
        other => return Err(EvalError::Type(format!("len: unsupported {:?}", other))),
    };
    Ok(Value::Int(n as i64))
}

fn contains(args: &[Value]) -> Result<Value, EvalError> {
    let args = exactly(args, 2, "contains")?;
    if let Value::List(items) = &args[0] {
        let needle = &args[1];
        return Ok(Value::Bool(items.iter().any(|v| v == needle)));
    }
    let haystack = str_arg(&args[0], "contains")?;
    let needle = str_arg(&args[1], "contains")?;
    Ok(Value::Bool(haystack.contains(&needle)))
}

fn contains_any(args: &[Value]) -> Result<Value, EvalError> {
    if args.len() < 2 {
        return Err(EvalError::Arity {
            function: "contains_any",
            expected: "2",
            got: args.len(),
        });
    }
    let haystack = str_arg(&args[0], "contains_any")?;
    for needle in &args[1..] {
        match needle {
            Value::List(items) => {
                for item in items {
                    if haystack.contains(&str_arg(item, "contains_any")?) {
                        return Ok(Value::Bool(true));
                    }
                }
            }
            other => {
                if haystack.contains(&str_arg(other, "contains_any")?) {
                    return Ok(Value::Bool(true));
                }
            }
        }
    }
    Ok(Value::Bool(false))
}

fn starts_with(args: &[Value]) -> Result<Value, EvalError> {
    let args = exactly(args, 2, "starts_with")?;
    let s = str_arg(&args[0], "starts_with")?;
    let prefix = str_arg(&args[1], "starts_with")?;
    Ok(Value::Bool(s.starts_with(&prefix)))
}

fn ends_with(args: &[Value]) -> Result<Value, EvalError> {
    let args = exactly(args, 2, "ends_with")?;
    let s = str_arg(&args[0], "ends_with")?;
    let suffix = str_arg(&args[1], "ends_with")?;
    Ok(Value::Bool(s.ends_with(&suffix)))
}

/// `trim(s)` trims whitespace; `trim(s, cutset)` trims the given characters.
fn trim(args: &[Value]) -> Result<Value, EvalError> {
    match args.len() {
        1 => map_str(args, "trim", |s| s.trim().to_string()),
        2 => {
            let s = str_arg(&args[0], "trim")?;
            let cutset = str_arg(&args[1], "trim")?;
            let chars: Vec<char> = cutset.chars().collect();
            Ok(Value::String(s.trim_matches(|c| chars.contains(&c)).to_string()))
        }
        got => Err(EvalError::Arity {
            function: "trim",
            expected: "1 or 2",
            got,
        }),
    }
}

fn compile_regex(pattern: &str) -> Result<Regex, EvalError> {
    Regex::new(pattern).map_err(|_| EvalError::Regex(pattern.to_string()))
}

fn regex_match(args: &[Value]) -> Result<Value, EvalError> {
    let args = exactly(args, 2, "regex")?;
    let pattern = str_arg(&args[0], "regex")?;
    let haystack = str_arg(&args[1], "regex")?;
    Ok(Value::Bool(compile_regex(&pattern)?.is_match(&haystack)))
}

fn regex_all(args: &[Value]) -> Result<Value, EvalError> {
    let args = exactly(args, 2, "regex_all")?;
    let pattern = str_arg(&args[0], "regex_all")?;
    let haystack = str_arg(&args[1], "regex_all")?;
    let re = compile_regex(&pattern)?;
    let matches = re
        .find_iter(&haystack)
        .map(|m| Value::String(m.as_str().to_string()))
        .collect();
    Ok(Value::List(matches))
}

fn base64_decode(args: &[Value]) -> Result<Value, EvalError> {
    let args = exactly(args, 1, "base64_decode")?;
    let encoded = str_arg(&args[0], "base64_decode")?;
    let bytes = STANDARD
        .decode(encoded.trim().as_bytes())
        .map_err(|e| EvalError::Type(format!("base64_decode: {}", e)))?;
    Ok(match String::from_utf8(bytes) {
        Ok(s) => Value::String(s),
        Err(e) => Value::Bytes(e.into_bytes()),
    })
}

pub(crate) fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Decodes a hex string into bytes. Shared with binary matcher compilation.
pub(crate) fn hex_decode(input: &str) -> Option<Vec<u8>> {
    let cleaned: String = input.chars().filter(|c| !c.is_whitespace()).collect();
    if cleaned.len() % 2 != 0 {
        return None;
    }
    (0..cleaned.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&cleaned[i..i + 2], 16).ok())
        .collect()
}

fn hex_decode_fn(args: &[Value]) -> Result<Value, EvalError> {
    let args = exactly(args, 1, "hex_decode")?;
    let encoded = str_arg(&args[0], "hex_decode")?;
    let bytes = hex_decode(&encoded)
        .ok_or_else(|| EvalError::Type(format!("hex_decode: invalid hex '{}'", encoded)))?;
    Ok(match String::from_utf8(bytes) {
        Ok(s) => Value::String(s),
        Err(e) => Value::Bytes(e.into_bytes()),
    })
}

fn url_decode(args: &[Value]) -> Result<Value, EvalError> {
    let args = exactly(args, 1, "url_decode")?;
    let encoded = str_arg(&args[0], "url_decode")?;
    let decoded = urlencoding::decode(&encoded)
        .map_err(|e| EvalError::Type(format!("url_decode: {}", e)))?;
    Ok(Value::String(decoded.into_owned()))
}

fn concat(args: &[Value]) -> Result<Value, EvalError> {
    let mut out = String::new();
    for arg in args {
        out.push_str(&arg.to_string());
    }
    Ok(Value::String(out))
}

/// `rand_int()` = [0, i32::MAX); `rand_int(max)` = [0, max); `rand_int(min, max)`.
fn rand_int(args: &[Value]) -> Result<Value, EvalError> {
    let mut rng = rand::thread_rng();
    let (min, max) = match args.len() {
        0 => (0, i32::MAX as i64),
        1 => (
            0,
            args[0]
                .as_int()
                .ok_or_else(|| EvalError::Type("rand_int: bound must be an integer".into()))?,
        ),
        2 => (
            args[0]
                .as_int()
                .ok_or_else(|| EvalError::Type("rand_int: bound must be an integer".into()))?,
            args[1]
                .as_int()
                .ok_or_else(|| EvalError::Type("rand_int: bound must be an integer".into()))?,
        ),
        got => {
            return Err(EvalError::Arity {
                function: "rand_int",
                expected: "0, 1 or 2",
                got,
            })
        }
    };
    if min >= max {
        return Err(EvalError::Type("rand_int: empty range".to_string()));
    }
    Ok(Value::Int(rng.gen_range(min..max)))
}

/// `rand_base(n)` produces n random lowercase alphanumerics;
/// `rand_base(n, charset)` draws from the given characters.
fn rand_base(args: &[Value]) -> Result<Value, EvalError> {
    const DEFAULT_CHARSET: &str = "abcdefghijklmnopqrstuvwxyz0123456789";
    let (n, charset) = match args.len() {
        1 => (args[0].as_int(), DEFAULT_CHARSET.to_string()),
        2 => (args[0].as_int(), str_arg(&args[1], "rand_base")?),
        got => {
            return Err(EvalError::Arity {
                function: "rand_base",
                expected: "1 or 2",
                got,
            })
        }
    };
    let n = n.ok_or_else(|| EvalError::Type("rand_base: length must be an integer".into()))?;
    let chars: Vec<char> = charset.chars().collect();
    if chars.is_empty() || n < 0 {
        return Err(EvalError::Type("rand_base: empty charset".to_string()));
    }
    let mut rng = rand::thread_rng();
    let out: String = (0..n).map(|_| chars[rng.gen_range(0..chars.len())]).collect();
    Ok(Value::String(out))
}

fn to_number(args: &[Value]) -> Result<Value, EvalError> {
    let args = exactly(args, 1, "to_number")?;
    if let Some(i) = args[0].as_int() {
        let as_float = args[0].as_float().unwrap_or(i as f64);
        if as_float == i as f64 {
            return Ok(Value::Int(i));
        }
    }
    args[0]
        .as_float()
        .map(Value::Float)
        .ok_or_else(|| EvalError::Type(format!("to_number: cannot convert {:?}", args[0])))
}

fn replace(args: &[Value]) -> Result<Value, EvalError> {
    let args = exactly(args, 3, "replace")?;
    let s = str_arg(&args[0], "replace")?;
    let from = str_arg(&args[1], "replace")?;
    let to = str_arg(&args[2], "replace")?;
    Ok(Value::String(s.replace(&from, &to)))
}

fn split(args: &[Value]) -> Result<Value, EvalError> {
    let args = exactly(args, 2, "split")?;
    let s = str_arg(&args[0], "split")?;
    let sep = str_arg(&args[1], "split")?;
    let parts = s
        .split(sep.as_str())
        .map(|p| Value::String(p.to_string()))
        .collect();
    Ok(Value::List(parts))
}

fn join(args: &[Value]) -> Result<Value, EvalError> {
    let args = exactly(args, 2, "join")?;
    let items = match &args[0] {
        Value::List(items) => items,
        other => return Err(EvalError::Type(format!("join: expected a list, got {:?}", other))),
    };
    let sep = str_arg(&args[1], "join")?;
    let parts: Vec<String> = items.iter().map(|v| v.to_string()).collect();
    Ok(Value::String(parts.join(&sep)))
}

fn substr(args: &[Value]) -> Result<Value, EvalError> {
    if args.len() != 2 && args.len() != 3 {
        return Err(EvalError::Arity {
            function: "substr",
            expected: "2 or 3",
            got: args.len(),
        });
    }
    let s = str_arg(&args[0], "substr")?;
    let start = args[1]
        .as_int()
        .ok_or_else(|| EvalError::Type("substr: start must be an integer".into()))?
        .max(0) as usize;
    let chars: Vec<char> = s.chars().collect();
    let end = match args.get(2) {
        Some(v) => v
            .as_int()
            .ok_or_else(|| EvalError::Type("substr: end must be an integer".into()))?
            .max(0) as usize,
        None => chars.len(),
    };
    let start = start.min(chars.len());
    let end = end.clamp(start, chars.len());
    Ok(Value::String(chars[start..end].iter().collect()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(v: &str) -> Value {
        Value::from(v)
    }

    #[test]
    fn string_predicates() {
        assert_eq!(call("contains", &[s("hello"), s("ell")]), Ok(Value::Bool(true)));
        assert_eq!(call("contains", &[s("hello"), s("xyz")]), Ok(Value::Bool(false)));
        assert_eq!(call("starts_with", &[s("hello"), s("he")]), Ok(Value::Bool(true)));
        assert_eq!(call("ends_with", &[s("hello"), s("lo")]), Ok(Value::Bool(true)));
        assert_eq!(
            call("contains_any", &[s("hello"), s("xyz"), s("ell")]),
            Ok(Value::Bool(true))
        );
    }

    #[test]
    fn case_and_trim() {
        assert_eq!(call("to_lower", &[s("AbC")]), Ok(s("abc")));
        assert_eq!(call("to_upper", &[s("AbC")]), Ok(s("ABC")));
        assert_eq!(call("trim_space", &[s("  x  ")]), Ok(s("x")));
        assert_eq!(call("trim", &[s("__x__"), s("_")]), Ok(s("x")));
    }

    #[test]
    fn len_of_values() {
        assert_eq!(call("len", &[s("abcd")]), Ok(Value::Int(4)));
        assert_eq!(call("len", &[Value::List(vec![s("a")])]), Ok(Value::Int(1)));
        assert_eq!(call("len", &[Value::Null]), Ok(Value::Int(0)));
    }

    #[test]
    fn encodings_round_trip() {
        assert_eq!(call("base64", &[s("test")]), Ok(s("dGVzdA==")));
        assert_eq!(call("base64_decode", &[s("dGVzdA==")]), Ok(s("test")));
        assert_eq!(call("hex_encode", &[s("AB")]), Ok(s("4142")));
        assert_eq!(call("hex_decode", &[s("4142")]), Ok(s("AB")));
        assert_eq!(call("url_encode", &[s("a b&c")]), Ok(s("a%20b%26c")));
        assert_eq!(call("url_decode", &[s("a%20b%26c")]), Ok(s("a b&c")));
    }

    #[test]
    fn digests() {
        assert_eq!(
            call("md5", &[s("hello")]),
            Ok(s("5d41402abc4b2a76b9719d911017c592"))
        );
        assert_eq!(
            call("sha1", &[s("hello")]),
            Ok(s("aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d"))
        );
        assert_eq!(
            call("sha256", &[s("hello")]),
            Ok(s("2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"))
        );
    }

    #[test]
    fn regex_functions() {
        assert_eq!(
            call("regex", &[s(r"ver=\d+"), s("ver=12")]),
            Ok(Value::Bool(true))
        );
        assert_eq!(
            call("regex_all", &[s(r"\d+"), s("a1b22c")]),
            Ok(Value::List(vec![s("1"), s("22")]))
        );
        assert!(matches!(
            call("regex", &[s("("), s("x")]),
            Err(EvalError::Regex(_))
        ));
    }

    #[test]
    fn rand_helpers_respect_bounds() {
        for _ in 0..20 {
            let v = call("rand_int", &[Value::Int(5), Value::Int(10)]).unwrap();
            let i = v.as_int().unwrap();
            assert!((5..10).contains(&i));
        }
        let v = call("rand_base", &[Value::Int(12)]).unwrap();
        assert_eq!(v.to_string().len(), 12);
    }

    #[test]
    fn string_manipulation() {
        assert_eq!(call("concat", &[s("a"), Value::Int(1), s("b")]), Ok(s("a1b")));
        assert_eq!(call("replace", &[s("a-b-c"), s("-"), s("+")]), Ok(s("a+b+c")));
        assert_eq!(
            call("split", &[s("a,b"), s(",")]),
            Ok(Value::List(vec![s("a"), s("b")]))
        );
        assert_eq!(
            call("join", &[Value::List(vec![s("a"), s("b")]), s("/")]),
            Ok(s("a/b"))
        );
        assert_eq!(call("substr", &[s("abcdef"), Value::Int(1), Value::Int(3)]), Ok(s("bc")));
        assert_eq!(call("substr", &[s("abcdef"), Value::Int(4)]), Ok(s("ef")));
    }

    #[test]
    fn unknown_function_is_an_error() {
        assert_eq!(
            call("nope", &[]),
            Err(EvalError::UnknownFunction("nope".to_string()))
        );
    }

    #[test]
    fn arity_errors() {
        assert!(matches!(call("len", &[]), Err(EvalError::Arity { .. })));
        assert!(matches!(
            call("contains", &[s("x")]),
            Err(EvalError::Arity { .. })
        ));
    }
}
