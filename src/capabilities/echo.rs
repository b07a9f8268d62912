//! `system.echo` — a side-effect-free diagnostic capability.

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{Capability, CapabilityOutput, EffectAction, ExecutionContext, PlannedEffect};
use crate::registry::{CapabilitySpec, IoSchema, Version};

/// Returns its input unchanged under `echo`.
#[derive(Debug, Default, Clone)]
pub struct EchoCapability;

impl EchoCapability {
    pub const NAME: &'static str = "system.echo";

    /// The spec this capability is registered under.
    pub fn spec() -> CapabilitySpec {
        CapabilitySpec::new(Self::NAME, Version::new(1, 0, 0))
            .with_description("Echo the input payload back to the caller")
            .with_category("system")
            .with_tag("diagnostics")
            .with_io_schema(IoSchema {
                success_fields: vec!["echo".to_string()],
                ..Default::default()
            })
    }
}

#[async_trait]
impl Capability for EchoCapability {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn execute(&self, input: &Value, ctx: &ExecutionContext) -> CapabilityOutput {
        CapabilityOutput::ok(json!({
            "echo": input,
            "request_id": ctx.request_id,
        }))
    }

    fn plan(&self, _input: &Value) -> Vec<PlannedEffect> {
        vec![PlannedEffect::new(EffectAction::Read, "request payload")]
    }
}
