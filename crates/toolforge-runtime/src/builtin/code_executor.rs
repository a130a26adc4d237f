//! `code-executor`: run a caller-supplied WebAssembly program.
//!
//! The program arrives either as the whole input (text) or as the `code`
//! field of an object input.  Text starting with `(` is WAT; anything else
//! must be base64 of a binary module.  The export named by `function`
//! (default `main`) is called with the numeric `args`.
//!
//! The guest runs with the instance's memory ceiling and a fuel budget taken
//! from the `max_fuel` option.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::{Value, json};

use super::json_type_name;
use crate::config::{DEFAULT_MAX_FUEL, ResolvedConfig};
use crate::error::{ModuleError, Result, SandboxError};
use crate::module::{ExecuteOptions, ModuleOutput};
use crate::sandbox::{GuestLimits, WasmSandbox};

pub(super) const OPERATIONS: &[&str] = &["execute"];

const DEFAULT_FUNCTION: &str = "main";
const WASM_MAGIC: &[u8] = b"\0asm";

struct Program {
    code: String,
    function: String,
    args: Vec<Value>,
}

pub(super) fn run(
    input: Value,
    options: &ExecuteOptions,
    config: &ResolvedConfig,
    sandbox: &WasmSandbox,
) -> Result<ModuleOutput> {
    let program = program(input, options, config)?;
    let bytes = decode(&program.code)?;

    let limits = GuestLimits {
        max_memory: usize::try_from(config.max_memory).unwrap_or(usize::MAX),
        max_fuel: options
            .param("max_fuel", config)
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_MAX_FUEL),
    };

    let module = sandbox.compile(&bytes).map_err(|e| match e {
        SandboxError::Compilation(msg) => {
            ModuleError::invalid_input(format!("program does not compile: {msg}"))
        }
        other => other.into(),
    })?;
    let out = sandbox.call_export(&module, &program.function, &program.args, &limits)?;

    tracing::debug!(
        function = %program.function,
        fuel_consumed = out.fuel_consumed,
        memory_peak = out.memory_peak,
        "guest program finished"
    );

    let mut data = json!({
        "returns": out.returns,
        "logs": out.logs,
        "fuel_consumed": out.fuel_consumed,
    });
    if !out.output.is_empty() {
        data["output"] = Value::String(String::from_utf8_lossy(&out.output).into_owned());
    }
    Ok(ModuleOutput::new(data).with_memory_peak(out.memory_peak as u64))
}

fn program(input: Value, options: &ExecuteOptions, config: &ResolvedConfig) -> Result<Program> {
    let (code, function, args) = match input {
        Value::String(code) => (code, None, None),
        Value::Object(mut map) => {
            let code = match map.remove("code") {
                Some(Value::String(code)) => code,
                _ => {
                    return Err(ModuleError::invalid_input(
                        "object input needs a string field 'code'",
                    ));
                }
            };
            (code, map.remove("function"), map.remove("args"))
        }
        other => {
            return Err(ModuleError::invalid_input(format!(
                "expected program text or an object, got {}",
                json_type_name(&other)
            )));
        }
    };

    let function = match function.or_else(|| options.param("function", config).cloned()) {
        None => DEFAULT_FUNCTION.to_owned(),
        Some(Value::String(name)) => name,
        Some(other) => {
            return Err(ModuleError::invalid_input(format!(
                "function must be a string, got {}",
                json_type_name(&other)
            )));
        }
    };
    let args = match args.or_else(|| options.param("args", config).cloned()) {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(args)) => args,
        Some(other) => vec![other],
    };

    Ok(Program {
        code,
        function,
        args,
    })
}

fn decode(code: &str) -> Result<Vec<u8>> {
    let trimmed = code.trim();
    if trimmed.starts_with('(') {
        return Ok(trimmed.as_bytes().to_vec());
    }
    let bytes = BASE64
        .decode(trimmed)
        .map_err(|e| ModuleError::invalid_input(format!("program is neither WAT nor base64: {e}")))?;
    if !bytes.starts_with(WASM_MAGIC) {
        return Err(ModuleError::invalid_input(
            "decoded program is not a WebAssembly binary",
        ));
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModuleConfig;
    use crate::error::ErrorCode;

    const ADD_WAT: &str = r#"(module (func (export "add") (param i32 i32) (result i32)
        local.get 0 local.get 1 i32.add))"#;

    const LOOP_WAT: &str = r#"(module (func (export "main") (loop $l br $l)))"#;

    fn exec(input: Value, options: ExecuteOptions) -> Result<ModuleOutput> {
        let sandbox = WasmSandbox::new().unwrap();
        let config = ModuleConfig::new().with_max_memory(2 * 1024 * 1024).resolve("code-executor");
        run(input, &options, &config, &sandbox)
    }

    #[test]
    fn runs_wat_with_args() {
        let out = exec(
            json!({"code": ADD_WAT, "function": "add", "args": [2, 40]}),
            ExecuteOptions::new("execute"),
        )
        .unwrap();
        assert_eq!(out.data["returns"], json!([42]));
        assert!(out.data["fuel_consumed"].as_u64().unwrap() > 0);
    }

    #[test]
    fn function_and_args_from_params() {
        let out = exec(
            json!(ADD_WAT),
            ExecuteOptions::new("execute")
                .with_param("function", "add")
                .with_param("args", json!([1, 1])),
        )
        .unwrap();
        assert_eq!(out.data["returns"], json!([2]));
    }

    #[test]
    fn runs_base64_binary() {
        // (module (func (export "main") (result i32) i32.const 7))
        let wasm: &[u8] = &[
            0x00, 0x61, 0x73, 0x6d, 0x01, 0x00, 0x00, 0x00, 0x01, 0x05, 0x01, 0x60, 0x00, 0x01,
            0x7f, 0x03, 0x02, 0x01, 0x00, 0x07, 0x08, 0x01, 0x04, 0x6d, 0x61, 0x69, 0x6e, 0x00,
            0x00, 0x0a, 0x06, 0x01, 0x04, 0x00, 0x41, 0x07, 0x0b,
        ];
        let out = exec(json!(BASE64.encode(wasm)), ExecuteOptions::new("execute")).unwrap();
        assert_eq!(out.data["returns"], json!([7]));
    }

    #[test]
    fn runaway_program_runs_out_of_fuel() {
        let err = exec(
            json!(LOOP_WAT),
            ExecuteOptions::new("execute").with_param("max_fuel", 10_000),
        )
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::ExecutionError);
        assert!(err.message.contains("fuel"));
    }

    #[test]
    fn memory_ceiling_applies() {
        // 64 pages = 4 MiB, above the 2 MiB ceiling.
        let err = exec(
            json!(r#"(module (memory 64) (func (export "main")))"#),
            ExecuteOptions::new("execute"),
        )
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::MemoryLimitExceeded);
    }

    #[test]
    fn garbage_is_invalid_input() {
        let err = exec(json!("not a program"), ExecuteOptions::new("execute")).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidInput);
        let err = exec(json!("(module (func"), ExecuteOptions::new("execute")).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidInput);
        let err = exec(json!(BASE64.encode(b"hello")), ExecuteOptions::new("execute")).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidInput);
    }
}
