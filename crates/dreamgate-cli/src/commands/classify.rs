use serde::Serialize;

use dreamgate_core::{classify, ErrorClassification, ProviderError};

use crate::cli::ClassifyArgs;
use crate::error::CliError;

use super::CommandResult;

#[derive(Debug, Serialize)]
struct ClassifyResponseData {
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<String>,
    classification: ErrorClassification,
}

pub fn run(args: &ClassifyArgs) -> Result<CommandResult, CliError> {
    if args.message.trim().is_empty() && args.status.is_none() && args.code.is_none() {
        return Err(CliError::Command(String::from(
            "an error message, status or code is required",
        )));
    }

    let mut error = ProviderError::new(args.message.clone());
    if let Some(status) = args.status {
        error = error.with_status(status);
    }
    if let Some(code) = &args.code {
        error = error.with_code(code.clone());
    }
    if let Some(retry_after) = &args.retry_after {
        error = error.with_header("retry-after", retry_after.clone());
    }

    let classification = classify(&error);
    let data = serde_json::to_value(ClassifyResponseData {
        message: args.message.clone(),
        status: args.status,
        code: args.code.clone(),
        classification,
    })?;

    Ok(CommandResult::ok(data))
}
