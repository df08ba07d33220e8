use super::{mismatch, HandlerContext, MessageHandler};
use crate::error::{WorkflowError, WorkflowResult};
use crate::geometry::{AxisSettings, GoniostatRotation, GoniostatTranslation};
use crate::protocol::{CentringDone, CentringStatus, MessageType, Payload, RequestCentring, Response};
use crate::queue::{TaskKind, TaskOutput};
use async_trait::async_trait;
use chrono::Utc;
use tracing::{info, warn};

/// Acknowledges `PrepareForCentring`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PrepareCentringHandler;

#[async_trait]
impl MessageHandler for PrepareCentringHandler {
    async fn handle(&self, payload: Payload, _ctx: &mut HandlerContext) -> WorkflowResult<Response> {
        let Payload::PrepareForCentring = payload else {
            return Err(mismatch(MessageType::PrepareForCentring));
        };
        Ok(Some(Payload::ReadyForCentring))
    }
}

/// Centres the sample at the requested rotation.
///
/// Enqueues one centring node under the root group, runs it, and records the resulting
/// translation. The first centred rotation becomes the recentring reference for later
/// requests.
#[derive(Debug, Clone, Copy, Default)]
pub struct CentringHandler;

#[async_trait]
impl MessageHandler for CentringHandler {
    async fn handle(&self, payload: Payload, ctx: &mut HandlerContext) -> WorkflowResult<Response> {
        let Payload::RequestCentring(request) = payload else {
            return Err(mismatch(MessageType::RequestCentring));
        };
        let RequestCentring {
            current_setting_no,
            total_rotations,
            goniostat_rotation: rotation,
        } = request;
        info!(
            setting = current_setting_no,
            total = total_rotations,
            rotation = %rotation.axis_settings(),
            "Centring requested"
        );

        ctx.positions.add_rotation(rotation.clone());
        let hint = recentring_hint(ctx, &rotation).await;

        let node = ctx.queue.create(
            "centring",
            TaskKind::Centring {
                rotation: rotation.clone(),
                hint,
            },
        );
        let root = ctx.queue.root();
        ctx.queue.enqueue(root, node)?;
        let entry = ctx.queue.get_entry(node)?;

        let TaskOutput::Centred(settings) = ctx.queue.execute(entry).await? else {
            return Err(WorkflowError::task(
                "centring",
                "centring finished without a translation",
            ));
        };

        let translation = GoniostatTranslation::for_rotation(&rotation, settings);
        ctx.positions.record_translation(translation.clone());

        let status = CentringStatus::for_setting(current_setting_no, total_rotations);
        info!(%status, translation = %translation.axis_settings(), "Centring done");
        Ok(Some(Payload::CentringDone(CentringDone {
            status,
            timestamp: Utc::now(),
            goniostat_translation: translation,
        })))
    }
}

/// Translation predicted from the reference pair, if recentring is available.
async fn recentring_hint(ctx: &HandlerContext, rotation: &GoniostatRotation) -> Option<AxisSettings> {
    let calculator = ctx.recentring.as_ref()?;
    let (reference, translation) = ctx.positions.reference_pair()?;
    if reference.id() == rotation.id() {
        return Some(translation.axis_settings().clone());
    }
    let settings = calculator.recentre(reference, translation, rotation).await;
    if settings.is_empty() {
        warn!("No recentring available; centring from the current position");
        return None;
    }
    Some(settings)
}
