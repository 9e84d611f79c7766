//! SSE surface over the pairing coordinator: an initial `status` event,
//! `qrcode` events as codes arrive, then a terminal `success` or `error`.

use std::convert::Infallible;
use std::io::Cursor;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, KeepAliveStream, Sse};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures::StreamExt as _;
use futures::stream::BoxStream;
use qrcode::QrCode;
use serde_json::json;
use tokio::sync::mpsc;

use crate::extract::TenantAuth;
use crate::pairing::PairingEvent;
use crate::service::GatewayState;

type EventStream = BoxStream<'static, Result<Event, Infallible>>;

pub(super) async fn open_pairing_sse(
    State(state): State<GatewayState>,
    TenantAuth(user_id): TenantAuth,
) -> Sse<KeepAliveStream<EventStream>> {
    let stream: EventStream = match state.pairing.open_pairing(&user_id).await {
        Ok(rx) => {
            let initial = futures::stream::once(async {
                Ok(Event::default()
                    .event("status")
                    .data(json!({"status": "pairing"}).to_string()))
            });

            initial.chain(pairing_events(rx)).boxed()
        }
        Err(error) => {
            let code = error.code();
            let message = error.to_string();

            futures::stream::once(async move {
                Ok(Event::default()
                    .event("error")
                    .data(json!({"error": code, "message": message}).to_string()))
            })
            .boxed()
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}

fn pairing_events(rx: mpsc::Receiver<PairingEvent>) -> impl futures::Stream<Item = Result<Event, Infallible>> {
    futures::stream::unfold(Some(rx), |state| async move {
        let mut rx = state?;

        let event = rx.recv().await?;
        let (event, terminal) = render(event);

        Some((Ok(event), (!terminal).then_some(rx)))
    })
}

fn render(event: PairingEvent) -> (Event, bool) {
    match event {
        PairingEvent::Code(code) => {
            let qrcode = match qr_png_base64(&code) {
                Ok(png) => Some(png),
                Err(error) => {
                    warn!(error = format!("{error:#}"), "Failed to render pairing QR code");
                    None
                }
            };

            (
                Event::default()
                    .event("qrcode")
                    .data(json!({"qrcode": qrcode, "data": code}).to_string()),
                false,
            )
        }
        PairingEvent::Success => (
            Event::default()
                .event("success")
                .data(json!({"status": "paired"}).to_string()),
            true,
        ),
        PairingEvent::Timeout => (
            Event::default()
                .event("error")
                .data(json!({"error": "PairingTimeout", "message": "pairing timed out"}).to_string()),
            true,
        ),
        PairingEvent::Error(message) => (
            Event::default()
                .event("error")
                .data(json!({"error": "PairingFailed", "message": message}).to_string()),
            true,
        ),
    }
}

/// Renders the pairing code as a base64 PNG for clients that show an image.
fn qr_png_base64(data: &str) -> anyhow::Result<String> {
    let code = QrCode::new(data.as_bytes())?;

    let image = code
        .render::<image::Luma<u8>>()
        .min_dimensions(256, 256)
        .build();

    let mut png = Vec::new();
    image::DynamicImage::ImageLuma8(image).write_to(&mut Cursor::new(&mut png), image::ImageFormat::Png)?;

    Ok(BASE64.encode(png))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qr_rendering_produces_a_png() {
        let encoded = qr_png_base64("LOOP-TEST-1234").expect("render");
        let bytes = BASE64.decode(encoded).expect("valid base64");

        // PNG magic number.
        assert_eq!(&bytes[..8], &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]);
    }

    #[test]
    fn terminal_events_close_the_stream() {
        assert!(!render(PairingEvent::Code("C".to_owned())).1);
        assert!(render(PairingEvent::Success).1);
        assert!(render(PairingEvent::Timeout).1);
        assert!(render(PairingEvent::Error("x".to_owned())).1);
    }
}
