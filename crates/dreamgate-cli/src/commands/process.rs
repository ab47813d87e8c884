use std::io::Read;

use serde_json::Value;

use dreamgate_core::{CoreConfig, ResponseProcessingPipeline};

use crate::cli::ProcessArgs;
use crate::error::CliError;
use crate::output::EnvelopeError;

use super::{to_operation, CommandResult};

pub fn run(args: &ProcessArgs, config: &CoreConfig) -> Result<CommandResult, CliError> {
    let input = match &args.file {
        Some(path) => std::fs::read_to_string(path)?,
        None => {
            let mut buffer = String::new();
            std::io::stdin().read_to_string(&mut buffer)?;
            buffer
        }
    };

    let payload = parse_payload(&input);
    let pipeline = ResponseProcessingPipeline::new(config.pipeline.clone());
    let result = pipeline.process_response(&payload, &args.provider, to_operation(args.operation));

    let warnings = result.metadata.warnings.clone();
    let latency_ms = result.metadata.duration_ms;
    let error = result.error.clone();
    let data = serde_json::to_value(&result)?;

    let mut command = CommandResult::ok(data)
        .with_warnings(warnings)
        .with_request_id(result.metadata.processing_id.clone())
        .with_latency(latency_ms)
        .with_source_chain(vec![args.provider.clone()]);
    if !result.success {
        command = command.with_error(EnvelopeError::new(
            "pipeline_failure",
            error.unwrap_or_else(|| String::from("response processing failed")),
        ));
    }
    Ok(command)
}

/// JSON documents are processed as such; anything else as a string.
fn parse_payload(input: &str) -> Value {
    serde_json::from_str(input).unwrap_or_else(|_| Value::String(input.to_owned()))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::cli::OperationArg;

    #[test]
    fn non_json_input_becomes_a_string() {
        assert_eq!(parse_payload("plain words"), Value::from("plain words"));
        assert_eq!(parse_payload("{\"a\":1}")["a"], 1);
    }

    #[test]
    fn processes_payload_file() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        write!(
            file,
            r#"{{"choices":[{{"message":{{"content":"{{\"title\":\"Moon\",}}"}}}}]}}"#
        )
        .expect("payload written");
        let args = ProcessArgs {
            file: Some(file.path().to_path_buf()),
            operation: OperationArg::Json,
            provider: String::from("cli"),
        };

        let result = run(&args, &CoreConfig::default()).expect("command runs");

        assert!(result.errors.is_empty());
        assert_eq!(result.data["success"], true);
        assert_eq!(result.data["parsed"]["title"], "Moon");
    }
}
