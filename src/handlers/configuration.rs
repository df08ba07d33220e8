use super::{mismatch, HandlerContext, MessageHandler};
use crate::error::WorkflowResult;
use crate::protocol::{ConfigurationData, MessageType, Payload, Response};
use async_trait::async_trait;
use tracing::info;

/// Answers `RequestConfiguration` with the beamline configuration directory.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConfigurationHandler;

#[async_trait]
impl MessageHandler for ConfigurationHandler {
    async fn handle(&self, payload: Payload, ctx: &mut HandlerContext) -> WorkflowResult<Response> {
        let Payload::RequestConfiguration(_) = payload else {
            return Err(mismatch(MessageType::RequestConfiguration));
        };
        let location = ctx.config.connection.configuration_location.clone();
        info!(%location, "Sending configuration location");
        Ok(Some(Payload::ConfigurationData(ConfigurationData { location })))
    }
}

/// Answers `ObtainPriorInformation` with what is known about the sample.
#[derive(Debug, Clone, Copy, Default)]
pub struct PriorInformationHandler;

#[async_trait]
impl MessageHandler for PriorInformationHandler {
    async fn handle(&self, payload: Payload, ctx: &mut HandlerContext) -> WorkflowResult<Response> {
        let Payload::ObtainPriorInformation(_) = payload else {
            return Err(mismatch(MessageType::ObtainPriorInformation));
        };
        let prior = ctx.prior_information.clone();
        info!(sample = %prior.sample_name, space_group = ?prior.space_group, "Sending prior information");
        Ok(Some(Payload::PriorInformation(prior)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::test_support::context;
    use crate::protocol::{ObtainPriorInformation, RequestConfiguration, UnitCell};
    use crate::queue::{TaskExecutor, TaskNode, TaskOutput};
    use std::sync::Arc;

    struct Idle;

    #[async_trait]
    impl TaskExecutor for Idle {
        async fn execute(&self, _node: &TaskNode) -> WorkflowResult<TaskOutput> {
            Ok(TaskOutput::None)
        }
    }

    #[tokio::test]
    async fn configuration_location_comes_from_config() {
        let (mut ctx, _) = context(Arc::new(Idle));
        let response = ConfigurationHandler
            .handle(Payload::RequestConfiguration(RequestConfiguration), &mut ctx)
            .await
            .unwrap();
        assert_eq!(
            response,
            Some(Payload::ConfigurationData(ConfigurationData {
                location: "/config/gphl".into()
            }))
        );
    }

    #[tokio::test]
    async fn prior_information_reflects_context() {
        let (mut ctx, _) = context(Arc::new(Idle));
        ctx.prior_information.space_group = Some("P212121".into());
        ctx.prior_information.cell = Some(UnitCell([40.0, 50.0, 60.0, 90.0, 90.0, 90.0]));

        let response = PriorInformationHandler
            .handle(Payload::ObtainPriorInformation(ObtainPriorInformation), &mut ctx)
            .await
            .unwrap();
        let Some(Payload::PriorInformation(prior)) = response else {
            panic!("expected PriorInformation, got {response:?}");
        };
        assert_eq!(prior.space_group.as_deref(), Some("P212121"));
        assert_eq!(prior.sample_name, "sample");
    }

    #[tokio::test]
    async fn wrong_payload_is_a_protocol_error() {
        let (mut ctx, _) = context(Arc::new(Idle));
        let err = ConfigurationHandler
            .handle(Payload::SubprocessStopped, &mut ctx)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("RequestConfiguration"));
    }
}
