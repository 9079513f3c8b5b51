use codeshare_core::{AppEvent, ChannelState};
use qrcode::QrCode;
use qrcode::render::unicode;
use std::io::Write;
use tokio::sync::mpsc;

/// Render `text` as a terminal QR code
pub fn render_qr(text: &str) -> Option<String> {
    let code = QrCode::new(text.as_bytes()).ok()?;
    Some(
        code.render::<unicode::Dense1x2>()
            .dark_color(unicode::Dense1x2::Light)
            .light_color(unicode::Dense1x2::Dark)
            .quiet_zone(true)
            .build(),
    )
}

fn end_progress_line(in_progress: &mut bool) {
    if *in_progress {
        println!();
        *in_progress = false;
    }
}

/// Print core events until every sender is dropped
pub async fn print_events(mut rx: mpsc::Receiver<AppEvent>) {
    let mut in_progress = false;
    while let Some(event) = rx.recv().await {
        match event {
            AppEvent::TransferProgress {
                file_name,
                progress,
                speed,
                is_sending,
                ..
            } => {
                let arrow = if is_sending { "↑" } else { "↓" };
                print!("\r{} {} {:5.1}%  {:>12}", arrow, file_name, progress, speed);
                let _ = std::io::stdout().flush();
                in_progress = true;
            }
            other => {
                end_progress_line(&mut in_progress);
                print_event(other);
            }
        }
    }
    end_progress_line(&mut in_progress);
}

fn print_event(event: AppEvent) {
    match event {
        AppEvent::CodeReady { code } => {
            println!("Code: {}", code);
            if let Some(qr) = render_qr(&code) {
                println!("{}", qr);
            }
            println!("On the other machine run: codeshare receive {}", code);
        }
        AppEvent::ChannelState(state) => match state {
            ChannelState::Negotiating => println!("Connecting..."),
            ChannelState::Connected => println!("Connected"),
            ChannelState::Failed => println!("Connection attempt failed"),
            _ => {}
        },
        AppEvent::IncomingFile { name, size } => {
            println!("Incoming: {} ({} bytes)", name, size);
        }
        AppEvent::TransferCompleted(name) => println!("Sent {}", name),
        AppEvent::FileReconstructed { name, size } => {
            println!("Received {} ({} bytes), digest verified", name, size);
        }
        AppEvent::FileSaved { path } => println!("Saved to {}", path.display()),
        AppEvent::Status(msg) => println!("{}", msg),
        AppEvent::Error(msg) => eprintln!("Error: {}", msg),
        AppEvent::TransferProgress { .. } => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_qr() {
        let qr = render_qr("aB3xZ").unwrap();
        assert!(qr.lines().count() > 10);
    }
}
