use qrcode::{render::svg, QrCode};
use rocket::{get, State};
use rocket_dyn_templates::{context, Template};

use crate::{authority::SessionAuthority, error::Error};

/// Landing page: a fresh offer rendered as a QR code for a wallet to scan.
#[get("/")]
pub fn index(authority: &State<SessionAuthority>) -> Result<Template, Error> {
    let created = authority.create_offer(None)?;
    let image = qr_svg(&created.offer_uri);

    Ok(Template::render(
        "index",
        context! {
            url: created.offer_uri,
            image: image,
        },
    ))
}

/// Renders `data` as an SVG QR code, or `None` when it does not fit.
pub fn qr_svg(data: &str) -> Option<String> {
    let code = QrCode::new(data).ok()?;
    Some(
        code.render()
            .min_dimensions(256, 256)
            .dark_color(svg::Color("#000000"))
            .light_color(svg::Color("#ffffff"))
            .build(),
    )
}
