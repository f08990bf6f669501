use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

use crate::dispatcher::Broker;
use crate::error::TransportError;
use crate::frame::{FrameReader, FrameWriter};
use crate::protocol::{OutboundMessage, CMD_ERROR};
use crate::settings::HostSettings;

const REPLY_TOO_LARGE: &str = "reply too large";

/// Announce the host, then serve frames one at a time until the extension
/// disconnects. Returns the number of frames handled.
///
/// Only transport failures end the loop with an error.
pub async fn run<R, W>(
    reader: R,
    writer: W,
    broker: &mut Broker,
    settings: &HostSettings,
) -> Result<u64, TransportError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut reader = FrameReader::new(reader, settings.max_frame_len);
    let mut writer = FrameWriter::new(writer, settings.max_frame_len);

    send(&mut writer, &OutboundMessage::connected(&settings.app_id)).await?;
    info!(app_id = %settings.app_id, "native messaging host connected");

    let mut handled = 0u64;
    while let Some(frame) = reader.read_frame().await? {
        let reply = broker.handle_frame(&frame).await;
        send(&mut writer, &reply).await?;
        handled += 1;
    }
    info!(frames = handled, "extension disconnected");
    Ok(handled)
}

async fn send<W: AsyncWrite + Unpin>(
    writer: &mut FrameWriter<W>,
    message: &OutboundMessage,
) -> Result<(), TransportError> {
    let body = serde_json::to_vec(message)?;
    debug!(command = message.command().unwrap_or("encrypted"), len = body.len(), "sending frame");
    match writer.write_frame(&body).await {
        // Nothing was written; answer with a short notice instead.
        Err(TransportError::FrameTooLarge { len, max }) => {
            warn!(len, max, "reply exceeds frame limit");
            let notice = OutboundMessage::error(CMD_ERROR, None, REPLY_TOO_LARGE);
            writer.write_frame(&serde_json::to_vec(&notice)?).await
        }
        res => res,
    }
}
