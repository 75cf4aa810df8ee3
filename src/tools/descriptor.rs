use super::ToolError;
use serde::Serialize;
use serde_json::{json, Map, Value};

/// JSON type of a tool parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ParamKind {
    String,
    Integer,
    Number,
    Boolean,
    Object,
}

impl ParamKind {
    fn accepts(self, value: &Value) -> bool {
        match self {
            ParamKind::String => value.is_string(),
            ParamKind::Integer => value.is_i64() || value.is_u64(),
            ParamKind::Number => value.is_number(),
            ParamKind::Boolean => value.is_boolean(),
            ParamKind::Object => value.is_object(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ParameterSpec {
    pub name: String,
    pub kind: ParamKind,
    pub description: String,
    pub required: bool,
    pub enum_values: Vec<String>,
    pub default: Option<Value>,
}

impl ParameterSpec {
    pub fn new(name: &str, kind: ParamKind, description: &str) -> Self {
        Self {
            name: name.to_string(),
            kind,
            description: description.to_string(),
            required: false,
            enum_values: Vec::new(),
            default: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn one_of(mut self, values: &[&str]) -> Self {
        self.enum_values = values.iter().map(|v| v.to_string()).collect();
        self
    }

    pub fn default_value(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    fn schema(&self) -> Value {
        let mut schema = Map::new();
        schema.insert("type".into(), json!(self.kind));
        schema.insert("description".into(), json!(self.description));
        if !self.enum_values.is_empty() {
            schema.insert("enum".into(), json!(self.enum_values));
        }
        if let Some(default) = &self.default {
            schema.insert("default".into(), default.clone());
        }
        if self.kind == ParamKind::Object {
            schema.insert("additionalProperties".into(), json!(true));
        }
        Value::Object(schema)
    }

    fn check(&self, value: &Value) -> Result<(), String> {
        if !self.kind.accepts(value) {
            return Err(format!("'{}' must be of type {}", self.name, self.kind));
        }
        if !self.enum_values.is_empty() {
            let matches = value
                .as_str()
                .map(|s| self.enum_values.iter().any(|e| e.eq_ignore_ascii_case(s)))
                .unwrap_or(false);
            if !matches {
                return Err(format!(
                    "'{}' must be one of [{}]",
                    self.name,
                    self.enum_values.join(", ")
                ));
            }
        }
        Ok(())
    }
}

/// Static schema advertised to the agent and used to validate incoming calls
#[derive(Debug, Clone)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub parameters: Vec<ParameterSpec>,
}

impl ToolDescriptor {
    pub fn new(name: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            parameters: Vec::new(),
        }
    }

    pub fn param(mut self, param: ParameterSpec) -> Self {
        self.parameters.push(param);
        self
    }

    /// JSON schema of the parameter object
    pub fn parameters_schema(&self) -> Value {
        let properties: Map<String, Value> = self
            .parameters
            .iter()
            .map(|p| (p.name.clone(), p.schema()))
            .collect();
        let required: Vec<&str> = self
            .parameters
            .iter()
            .filter(|p| p.required)
            .map(|p| p.name.as_str())
            .collect();

        json!({
            "type": "object",
            "properties": properties,
            "required": required
        })
    }

    /// Tool definition in the realtime session format
    pub fn to_function_definition(&self) -> Value {
        json!({
            "type": "function",
            "name": self.name,
            "description": self.description,
            "parameters": self.parameters_schema()
        })
    }

    /// Check required parameters, declared types and enums.
    /// Arguments that are not declared are passed through untouched.
    pub fn validate(&self, arguments: &Map<String, Value>) -> Result<(), ToolError> {
        let mut problems = Vec::new();

        for param in &self.parameters {
            match arguments.get(&param.name) {
                None | Some(Value::Null) if param.required => {
                    problems.push(format!("missing required parameter '{}'", param.name));
                }
                None | Some(Value::Null) => {}
                Some(value) => {
                    if let Err(problem) = param.check(value) {
                        problems.push(problem);
                    }
                }
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ToolError::InvalidParameters(problems.join("; ")))
        }
    }
}
