//! Network request blocks: raw TCP/TLS byte exchanges with read-until
//! semantics.

mod runner;

pub(crate) use runner::ProbeStream;

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::dsl;
use crate::error::CompileError;
use crate::operators::Operators;

/// Encoding of one input's `data` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputType {
    /// Variable-expanded text written as-is
    #[default]
    Text,
    /// Hex-decoded at compile time
    Hex,
}

/// One write (and optional sized read) on the connection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkInput {
    #[serde(default)]
    pub data: String,

    #[serde(rename = "type", default)]
    pub input_type: InputType,

    /// Bytes to read after sending; 0 skips the read
    #[serde(default)]
    pub read: usize,

    /// Binds the bytes read after this input into the variable map
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

pub(crate) const DEFAULT_READ_SIZE: usize = 1024;

fn default_read_size() -> usize {
    DEFAULT_READ_SIZE
}

/// One raw network interaction of a template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkRequest {
    /// Host expressions, e.g. `{{Hostname}}`, `tls://{{Hostname}}:443`,
    /// `{{Hostname}}:25`. Connects once per concrete iteration per host.
    #[serde(rename = "host", default)]
    pub hosts: Vec<String>,

    #[serde(default)]
    pub inputs: Vec<NetworkInput>,

    /// Size of the trailing read after the last input
    #[serde(rename = "read-size", default = "default_read_size")]
    pub read_size: usize,

    /// Drain the connection instead of a sized trailing read
    #[serde(rename = "read-all", default)]
    pub read_all: bool,

    #[serde(flatten)]
    pub operators: Operators,

    #[serde(skip)]
    pub(crate) compiled_inputs: Vec<CompiledInput>,
}

/// Input after compile-time hex decoding.
#[derive(Debug, Clone)]
pub(crate) enum CompiledInput {
    /// Still carries placeholders; expanded per dispatch
    Text { template: String, read: usize, name: Option<String> },
    Bytes { data: Vec<u8>, read: usize, name: Option<String> },
}

impl NetworkRequest {
    pub fn compile(&mut self, known: &BTreeSet<String>) -> Result<BTreeSet<String>, CompileError> {
        if self.hosts.is_empty() {
            return Err(CompileError::NoHosts);
        }

        for host in &self.hosts {
            for ident in dsl::placeholder_identifiers(host) {
                if !known.iter().any(|k| k.eq_ignore_ascii_case(&ident)) {
                    return Err(CompileError::UnresolvedVariable {
                        name: ident,
                        context: format!("host expression '{}'", host),
                    });
                }
            }
        }

        self.compiled_inputs = self
            .inputs
            .iter()
            .map(|input| match input.input_type {
                InputType::Hex => {
                    let data = dsl::functions::hex_decode(&input.data)
                        .ok_or_else(|| CompileError::InvalidHex(input.data.clone()))?;
                    Ok(CompiledInput::Bytes {
                        data,
                        read: input.read,
                        name: input.name.clone(),
                    })
                }
                InputType::Text => Ok(CompiledInput::Text {
                    template: input.data.clone(),
                    read: input.read,
                    name: input.name.clone(),
                }),
            })
            .collect::<Result<_, CompileError>>()?;

        // Per-input read bindings are visible to matchers and extractors.
        let mut scope = known.clone();
        scope.extend(self.inputs.iter().filter_map(|i| i.name.clone()));

        self.operators.compile(&scope)?;
        Ok(self.operators.extractor_names().map(str::to_string).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builtins() -> BTreeSet<String> {
        ["Hostname", "Host", "Port"]
            .into_iter()
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn compiles_text_and_hex_inputs() {
        let yaml = r#"
host:
  - "{{Hostname}}"
inputs:
  - data: "PING\r\n"
    read: 4
  - data: "deadbeef"
    type: hex
matchers:
  - type: word
    part: data
    words: [PONG]
"#;
        let mut req: NetworkRequest = serde_yaml::from_str(yaml).unwrap();
        req.compile(&builtins()).unwrap();
        assert_eq!(req.compiled_inputs.len(), 2);
        match &req.compiled_inputs[1] {
            CompiledInput::Bytes { data, .. } => {
                assert_eq!(data, &vec![0xde, 0xad, 0xbe, 0xef])
            }
            other => panic!("expected bytes input, got {:?}", other),
        }
    }

    #[test]
    fn bad_hex_input_fails_compile() {
        let yaml = r#"
host: ["{{Hostname}}"]
inputs:
  - data: "xx-not-hex"
    type: hex
"#;
        let mut req: NetworkRequest = serde_yaml::from_str(yaml).unwrap();
        assert!(matches!(
            req.compile(&builtins()),
            Err(CompileError::InvalidHex(_))
        ));
    }

    #[test]
    fn missing_hosts_fail_compile() {
        let mut req: NetworkRequest = serde_yaml::from_str("inputs: []").unwrap();
        assert!(matches!(req.compile(&builtins()), Err(CompileError::NoHosts)));
    }

    #[test]
    fn unknown_host_variable_fails_compile() {
        let yaml = "host: [\"{{NoSuchHost}}\"]";
        let mut req: NetworkRequest = serde_yaml::from_str(yaml).unwrap();
        assert!(matches!(
            req.compile(&builtins()),
            Err(CompileError::UnresolvedVariable { .. })
        ));
    }

    #[test]
    fn input_read_names_are_usable_in_matchers() {
        let yaml = r#"
host: ["{{Hostname}}"]
inputs:
  - data: "HELO\r\n"
    read: 64
    name: banner
matchers:
  - type: dsl
    dsl: ['contains(banner, "SMTP")']
"#;
        let mut req: NetworkRequest = serde_yaml::from_str(yaml).unwrap();
        assert!(req.compile(&builtins()).is_ok());
    }
}
