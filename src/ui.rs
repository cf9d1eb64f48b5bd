//! Operator-facing presentation: the download URL as text and QR code.

use anyhow::{Context, Result};
use console::style;
use qrcode::render::unicode;
use qrcode::QrCode;

/// Render the URL as a unicode QR code for the terminal.
pub fn generate_qr(url: &str) -> Result<String> {
    let code = QrCode::new(url.as_bytes()).context("Failed to generate QR code")?;

    Ok(code
        .render::<unicode::Dense1x2>()
        .dark_color(unicode::Dense1x2::Light)
        .light_color(unicode::Dense1x2::Dark)
        .quiet_zone(true)
        .build())
}

/// Compose the operator banner. The QR code and the address always print;
/// --quiet only drops the instructional lines around them.
fn render_banner(url: &str, quiet: bool) -> String {
    let mut banner = String::new();
    if !quiet {
        banner.push_str("Scan the following QR to start the download.\n");
        banner.push_str(
            "Make sure that your smartphone is connected to the same WiFi network as this computer.\n",
        );
    }
    match generate_qr(url) {
        Ok(qr) => {
            banner.push_str(&qr);
            banner.push('\n');
        }
        Err(err) => tracing::warn!("unable to render QR code: {err}"),
    }
    if quiet {
        banner.push_str(&format!("{}\n", style(url).bold().green()));
    } else {
        banner.push_str(&format!(
            "Your generated address is {}\n",
            style(url).bold().green()
        ));
    }
    banner
}

pub fn present(url: &str, quiet: bool) {
    print!("{}", render_banner(url, quiet));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qr_renders_for_a_typical_url() {
        let qr = generate_qr("http://192.168.1.10:40615/k3x9").expect("qr");
        assert!(!qr.is_empty());
    }

    #[test]
    fn quiet_banner_still_carries_the_address() {
        let url = "http://192.168.1.10:40615/k3x9";
        let banner = render_banner(url, true);
        assert!(banner.contains(url), "the address must survive --quiet");
        assert!(!banner.contains("Scan the following"));
        assert!(!banner.contains("Your generated address"));
    }

    #[test]
    fn verbose_banner_carries_instructions_and_address() {
        let url = "http://192.168.1.10:40615/k3x9";
        let banner = render_banner(url, false);
        assert!(banner.contains(url));
        assert!(banner.contains("Scan the following"));
    }
}
