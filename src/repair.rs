use serde_json::Value;

use crate::dispatch::adapter::ProviderAdapter;
use crate::dispatch::{GenerationRequest, SystemInstruction};
use crate::error::RelayError;
use crate::parse::parse_document;

const REPAIR_INSTRUCTION: &str = "You are a JSON repair tool. You receive a malformed JSON \
document and the error a strict parser reported for it. Return the corrected document only: \
valid JSON, same keys, same values, no commentary and no code fences.";

/// Asks the model behind `adapter` to fix a document the parse ladder gave up on.
///
/// Makes exactly one call. The reply goes through the local parse ladder
/// again, but never back into the repair agent.
pub struct JsonRepairAgent<'a> {
    adapter: &'a ProviderAdapter,
}

impl<'a> JsonRepairAgent<'a> {
    pub fn new(adapter: &'a ProviderAdapter) -> Self {
        Self { adapter }
    }

    fn request(broken: &str, parse_error: &str) -> GenerationRequest {
        let mut req = GenerationRequest::new(format!(
            "Parser error: {parse_error}\n\nMalformed JSON:\n{broken}"
        ))
        .with_system_instruction(SystemInstruction::Single(REPAIR_INSTRUCTION.to_string()))
        .with_temperature(0.0);
        // Empty language disables the configured language instruction.
        req.language = Some(String::new());
        req.try_auto_fix_json_error = Some(false);
        req
    }

    pub async fn repair(&self, broken: &str, parse_error: &str) -> Result<Value, RelayError> {
        let provider = self.adapter.name();
        let raw = self
            .adapter
            .complete(&Self::request(broken, parse_error))
            .await?;

        match parse_document(&raw.text) {
            Ok(value) => {
                tracing::info!(provider, "malformed JSON repaired by model");
                Ok(value)
            }
            Err(e) => {
                tracing::warn!(provider, "JSON repair failed: {e}");
                Err(RelayError::Parse {
                    message: format!("repair failed: {e}"),
                })
            }
        }
    }
}
