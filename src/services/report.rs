//! Renders the two-page daily trip report.
//!
//! The blank agency form ships as a PDF template under the asset root and
//! every value is drawn at a fixed coordinate on top of it. The template's
//! interactive form layer is stripped first so stale field widgets cannot
//! overdraw the filled values.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, Datelike, Utc};
use lopdf::{
    content::{Content, Operation},
    dictionary, xobject, Document, Object, ObjectId,
};
use thiserror::Error;
use tokio::{
    sync::{Mutex, OwnedMutexGuard, Semaphore},
    task::JoinHandle,
};
use tracing::warn;

use crate::{
    config::{AppConfig, ProviderProfile},
    error::AppError,
    models::{
        member::TripMember,
        roster::{Driver, Member, Vehicle},
        stop::{Stop, StopKind},
        trip::TripAggregate,
    },
    services::notify::NotifyService,
};

pub const TEMPLATE_FILE: &str = "daily_trip_report.pdf";

const FONT_REGULAR: &str = "TrHelv";
const FONT_BOLD: &str = "TrHelvB";
const SIGNATURE_SCALE: f32 = 0.35;
const LINE_HEIGHT: f32 = 14.0;
const WRAP_COLUMNS: usize = 88;

/// Field anchors in PDF user space, origin bottom-left, US Letter template.
mod layout {
    pub const PROVIDER_NAME: (f32, f32) = (72.0, 742.0);
    pub const PROVIDER_ID: (f32, f32) = (420.0, 742.0);
    pub const PROVIDER_ADDRESS: (f32, f32) = (72.0, 728.0);
    pub const PROVIDER_PHONE: (f32, f32) = (420.0, 728.0);
    pub const DRIVER_NAME: (f32, f32) = (110.0, 700.0);
    pub const REPORT_DATE: (f32, f32) = (460.0, 700.0);
    pub const VEHICLE_IDENT: (f32, f32) = (110.0, 682.0);
    pub const VEHICLE_COLOR_MAKE: (f32, f32) = (280.0, 682.0);
    pub const VEHICLE_TYPE: (f32, f32) = (460.0, 682.0);
    pub const MEMBER_EXTERNAL_ID: (f32, f32) = (140.0, 640.0);
    pub const MEMBER_DOB: (f32, f32) = (460.0, 640.0);
    pub const MEMBER_NAME: (f32, f32) = (140.0, 622.0);
    pub const MEMBER_ADDRESS: (f32, f32) = (140.0, 604.0);
    pub const PICKUP_ADDRESS: (f32, f32) = (96.0, 540.0);
    pub const PICKUP_TIME: (f32, f32) = (360.0, 540.0);
    pub const PICKUP_ODOMETER: (f32, f32) = (470.0, 540.0);
    pub const DROPOFF_ADDRESS: (f32, f32) = (96.0, 512.0);
    pub const DROPOFF_TIME: (f32, f32) = (360.0, 512.0);
    pub const DROPOFF_ODOMETER: (f32, f32) = (470.0, 512.0);
    pub const TRIP_REASON: (f32, f32) = (96.0, 478.0);
    pub const FOOTER_MEMBER_NAME: (f32, f32) = (140.0, 700.0);
    pub const ADDITIONAL_INFO: (f32, f32) = (72.0, 660.0);
    pub const MEMBER_SIGNATURE: (f32, f32) = (110.0, 300.0);
    pub const DRIVER_SIGNATURE: (f32, f32) = (110.0, 200.0);
    pub const DRIVER_SIGN_DATE: (f32, f32) = (420.0, 200.0);
}

/// Everything the renderer draws, already formatted for print.
#[derive(Debug, Clone)]
pub struct ReportData {
    pub org_id: String,
    pub trip_id: String,
    pub provider_name: String,
    pub provider_id: String,
    pub provider_address: String,
    pub provider_phone: String,
    pub report_date: String,
    pub driver_name: String,
    pub vehicle_identifier: String,
    pub vehicle_color_make: String,
    pub vehicle_type: String,
    pub member_external_id: String,
    pub member_dob: String,
    pub member_name: String,
    pub member_address: String,
    pub pickup_address: String,
    pub pickup_time: String,
    pub pickup_odometer: String,
    pub dropoff_address: String,
    pub dropoff_time: String,
    pub dropoff_odometer: String,
    pub trip_reason: String,
    pub additional_info: String,
    pub member_signature: Option<String>,
    pub driver_signature: Option<String>,
}

impl ReportData {
    /// Flattens one member's view of the trip into print strings. The pickup
    /// and dropoff rows come from the member's own stop references, falling
    /// back to the first pickup and last dropoff on the route.
    pub fn compose(
        provider: &ProviderProfile,
        aggregate: &TripAggregate,
        driver: Option<&Driver>,
        vehicle: Option<&Vehicle>,
        member: &Member,
        manifest: &TripMember,
    ) -> Self {
        let pickup = stop_for(aggregate, manifest.pickup_stop_id.as_deref(), StopKind::Pickup);
        let dropoff = stop_for(
            aggregate,
            manifest.dropoff_stop_id.as_deref(),
            StopKind::Dropoff,
        );
        Self {
            org_id: aggregate.trip.org_id.clone(),
            trip_id: aggregate.trip.id.clone(),
            provider_name: provider.name.clone(),
            provider_id: provider.provider_id.clone(),
            provider_address: provider.address.clone(),
            provider_phone: provider.phone.clone(),
            report_date: Utc::now().format("%m/%d/%Y").to_string(),
            driver_name: driver
                .map(|d| d.full_name.clone())
                .unwrap_or_else(|| "Unassigned".into()),
            vehicle_identifier: vehicle.map(|v| v.identifier.clone()).unwrap_or_default(),
            vehicle_color_make: vehicle.map(Vehicle::color_make).unwrap_or_default(),
            vehicle_type: vehicle.map(|v| v.vehicle_type.clone()).unwrap_or_default(),
            member_external_id: member.external_id.clone().unwrap_or_default(),
            member_dob: member
                .date_of_birth
                .map(|d| d.format("%m/%d/%Y").to_string())
                .unwrap_or_default(),
            member_name: member.full_name(),
            member_address: member.address.clone().unwrap_or_default(),
            pickup_address: pickup.map(|s| s.address.clone()).unwrap_or_default(),
            pickup_time: pickup.and_then(stop_time).unwrap_or_default(),
            pickup_odometer: pickup
                .and_then(|s| s.odometer)
                .map(|o| format!("{o:.1}"))
                .unwrap_or_default(),
            dropoff_address: dropoff.map(|s| s.address.clone()).unwrap_or_default(),
            dropoff_time: dropoff.and_then(stop_time).unwrap_or_default(),
            dropoff_odometer: dropoff
                .and_then(|s| s.odometer)
                .map(|o| format!("{o:.1}"))
                .unwrap_or_default(),
            trip_reason: aggregate.trip.reason.clone().unwrap_or_default(),
            additional_info: aggregate.trip.notes.clone().unwrap_or_default(),
            member_signature: manifest.signature.clone(),
            driver_signature: driver.and_then(|d| d.signature.clone()),
        }
    }
}

#[derive(Debug)]
pub struct RenderedReport {
    pub relative_path: String,
    pub bytes: Vec<u8>,
}

#[derive(Clone)]
pub struct ReportService {
    asset_root: PathBuf,
    reports_root: PathBuf,
    notify: NotifyService,
    render_slots: Arc<Semaphore>,
    trip_locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
    render_timeout: Duration,
}

impl ReportService {
    pub fn new(config: &AppConfig, notify: NotifyService) -> Self {
        Self {
            asset_root: config.asset_root.clone(),
            reports_root: config.reports_root.clone(),
            notify,
            render_slots: Arc::new(Semaphore::new(config.render_concurrency)),
            trip_locks: Arc::new(Mutex::new(HashMap::new())),
            render_timeout: config.render_timeout,
        }
    }

    pub fn template_path(&self) -> PathBuf {
        self.asset_root.join(TEMPLATE_FILE)
    }

    /// Renders the report and writes it under the date-partitioned reports
    /// tree. Renders for the same trip are serialized and total concurrency
    /// is capped by the slot pool; a render past the deadline returns
    /// `RenderTimeout`. A timed-out render keeps its slot and the trip's
    /// serial lock until the blocking task actually finishes, so runaways
    /// cannot stack up or overlap a retry of the same trip.
    pub async fn generate(&self, data: ReportData) -> Result<RenderedReport, AppError> {
        let serial = self.trip_lock(&data.trip_id).await.lock_owned().await;
        let permit = self
            .render_slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| AppError::Other(anyhow::anyhow!("render pool closed")))?;

        let template_path = self.template_path();
        let reports_root = self.reports_root.clone();
        let org_id = data.org_id.clone();
        let trip_id = data.trip_id.clone();
        let mut task = tokio::task::spawn_blocking(move || {
            let _slot = permit;
            render_and_persist(&template_path, &reports_root, &data)
        });
        let joined = match tokio::time::timeout(self.render_timeout, &mut task).await {
            Err(_) => {
                self.reap_abandoned_render(task, serial, trip_id);
                return Err(AppError::RenderTimeout);
            }
            Ok(joined) => joined,
        };
        drop(serial);
        self.prune_trip_lock(&trip_id).await;
        let rendered = joined.map_err(|err| AppError::Other(err.into()))??;

        self.notify
            .report_submitted(&org_id, &trip_id, &rendered.relative_path);
        Ok(rendered)
    }

    async fn trip_lock(&self, trip_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.trip_locks.lock().await;
        locks
            .entry(trip_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drops the lock entry once no render holds or awaits it. Waiters carry
    /// their own clone of the entry, so a contended lock survives the prune.
    async fn prune_trip_lock(&self, trip_id: &str) {
        let mut locks = self.trip_locks.lock().await;
        if let Some(entry) = locks.get(trip_id) {
            if Arc::strong_count(entry) == 1 {
                locks.remove(trip_id);
            }
        }
    }

    /// A timed-out render still owns the trip's serial lock; it is released
    /// and its entry pruned only once the blocking task actually returns.
    fn reap_abandoned_render(
        &self,
        task: JoinHandle<Result<RenderedReport, AppError>>,
        serial: OwnedMutexGuard<()>,
        trip_id: String,
    ) {
        let service = self.clone();
        tokio::spawn(async move {
            let _ = task.await;
            drop(serial);
            service.prune_trip_lock(&trip_id).await;
        });
    }
}

fn render_and_persist(
    template_path: &Path,
    reports_root: &Path,
    data: &ReportData,
) -> Result<RenderedReport, AppError> {
    if !template_path.is_file() {
        return Err(AppError::TemplateNotFound(template_path.to_path_buf()));
    }
    let mut doc = Document::load(template_path)?;
    let pages: Vec<ObjectId> = doc.get_pages().into_values().collect();
    if pages.len() < 2 {
        return Err(AppError::Other(anyhow::anyhow!(
            "report template must have at least two pages"
        )));
    }
    strip_form_layer(&mut doc, &pages)?;
    register_fonts(&mut doc, &pages)?;

    let mut front = Content {
        operations: Vec::new(),
    };
    text(&mut front, FONT_BOLD, 11.0, layout::PROVIDER_NAME, &data.provider_name);
    text(&mut front, FONT_REGULAR, 10.0, layout::PROVIDER_ID, &data.provider_id);
    text(&mut front, FONT_REGULAR, 9.0, layout::PROVIDER_ADDRESS, &data.provider_address);
    text(&mut front, FONT_REGULAR, 9.0, layout::PROVIDER_PHONE, &data.provider_phone);
    text(&mut front, FONT_REGULAR, 10.0, layout::DRIVER_NAME, &data.driver_name);
    text(&mut front, FONT_REGULAR, 10.0, layout::REPORT_DATE, &data.report_date);
    text(&mut front, FONT_REGULAR, 10.0, layout::VEHICLE_IDENT, &data.vehicle_identifier);
    text(&mut front, FONT_REGULAR, 10.0, layout::VEHICLE_COLOR_MAKE, &data.vehicle_color_make);
    text(&mut front, FONT_REGULAR, 10.0, layout::VEHICLE_TYPE, &data.vehicle_type);
    text(&mut front, FONT_REGULAR, 10.0, layout::MEMBER_EXTERNAL_ID, &data.member_external_id);
    text(&mut front, FONT_REGULAR, 10.0, layout::MEMBER_DOB, &data.member_dob);
    text(&mut front, FONT_BOLD, 10.0, layout::MEMBER_NAME, &data.member_name);
    text(&mut front, FONT_REGULAR, 9.0, layout::MEMBER_ADDRESS, &data.member_address);
    text(&mut front, FONT_REGULAR, 9.0, layout::PICKUP_ADDRESS, &data.pickup_address);
    text(&mut front, FONT_REGULAR, 9.0, layout::PICKUP_TIME, &data.pickup_time);
    text(&mut front, FONT_REGULAR, 9.0, layout::PICKUP_ODOMETER, &data.pickup_odometer);
    text(&mut front, FONT_REGULAR, 9.0, layout::DROPOFF_ADDRESS, &data.dropoff_address);
    text(&mut front, FONT_REGULAR, 9.0, layout::DROPOFF_TIME, &data.dropoff_time);
    text(&mut front, FONT_REGULAR, 9.0, layout::DROPOFF_ODOMETER, &data.dropoff_odometer);
    text(&mut front, FONT_REGULAR, 9.0, layout::TRIP_REASON, &data.trip_reason);
    doc.add_to_page_content(pages[0], front)?;

    let mut back = Content {
        operations: Vec::new(),
    };
    text(&mut back, FONT_BOLD, 10.0, layout::FOOTER_MEMBER_NAME, &data.member_name);
    let (info_x, info_y) = layout::ADDITIONAL_INFO;
    for (i, line) in wrap(&data.additional_info, WRAP_COLUMNS)
        .iter()
        .take(4)
        .enumerate()
    {
        text(
            &mut back,
            FONT_REGULAR,
            9.0,
            (info_x, info_y - i as f32 * LINE_HEIGHT),
            line,
        );
    }
    text(&mut back, FONT_REGULAR, 10.0, layout::DRIVER_SIGN_DATE, &data.report_date);
    doc.add_to_page_content(pages[1], back)?;

    if let Some(sig) = &data.member_signature {
        place_signature(&mut doc, pages[1], sig, layout::MEMBER_SIGNATURE);
    }
    match driver_line(data.driver_signature.as_deref(), &data.driver_name) {
        DriverLine::Image(sig) => place_signature(&mut doc, pages[1], sig, layout::DRIVER_SIGNATURE),
        DriverLine::Text(line) => {
            let mut mark = Content {
                operations: Vec::new(),
            };
            text(&mut mark, FONT_BOLD, 12.0, layout::DRIVER_SIGNATURE, line);
            doc.add_to_page_content(pages[1], mark)?;
        }
    }

    let now = Utc::now();
    let relative_path = report_path(&data.trip_id, now);
    let target = reports_root.join(&relative_path);
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut bytes = Vec::new();
    doc.save_to(&mut bytes)?;
    std::fs::write(&target, &bytes)?;
    Ok(RenderedReport {
        relative_path,
        bytes,
    })
}

/// Drops the AcroForm dictionary and page annotations. The template is a
/// fillable form; once values are drawn, leftover field widgets would sit
/// above them.
fn strip_form_layer(doc: &mut Document, pages: &[ObjectId]) -> Result<(), AppError> {
    let catalog_id = doc.trailer.get(b"Root")?.as_reference()?;
    doc.get_object_mut(catalog_id)?
        .as_dict_mut()?
        .remove(b"AcroForm");
    for &page_id in pages {
        doc.get_object_mut(page_id)?.as_dict_mut()?.remove(b"Annots");
    }
    Ok(())
}

fn register_fonts(doc: &mut Document, pages: &[ObjectId]) -> Result<(), AppError> {
    let regular = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Helvetica",
        "Encoding" => "WinAnsiEncoding",
    });
    let bold = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Helvetica-Bold",
        "Encoding" => "WinAnsiEncoding",
    });
    for &page_id in pages {
        let resources = page_resources_mut(doc, page_id)?;
        if resources.get(b"Font").is_err() {
            resources.set("Font", lopdf::Dictionary::new());
        }
        let fonts = resources.get_mut(b"Font")?.as_dict_mut()?;
        fonts.set(FONT_REGULAR, regular);
        fonts.set(FONT_BOLD, bold);
    }
    Ok(())
}

/// Resolves the page's Resources dictionary, following one level of
/// indirection; scanner-produced templates often store it as a reference.
fn page_resources_mut(
    doc: &mut Document,
    page_id: ObjectId,
) -> Result<&mut lopdf::Dictionary, AppError> {
    let resources_ref = {
        let page = doc.get_object(page_id)?.as_dict()?;
        match page.get(b"Resources") {
            Ok(Object::Reference(id)) => Some(*id),
            _ => None,
        }
    };
    if let Some(id) = resources_ref {
        return Ok(doc.get_object_mut(id)?.as_dict_mut()?);
    }
    let page = doc.get_object_mut(page_id)?.as_dict_mut()?;
    if page.get(b"Resources").is_err() {
        page.set("Resources", lopdf::Dictionary::new());
    }
    Ok(page.get_mut(b"Resources")?.as_dict_mut()?)
}

fn text(content: &mut Content, font: &str, size: f32, (x, y): (f32, f32), value: &str) {
    if value.is_empty() {
        return;
    }
    content.operations.push(Operation::new("BT", vec![]));
    content
        .operations
        .push(Operation::new("Tf", vec![font.into(), size.into()]));
    content
        .operations
        .push(Operation::new("Td", vec![x.into(), y.into()]));
    content
        .operations
        .push(Operation::new("Tj", vec![Object::string_literal(value)]));
    content.operations.push(Operation::new("ET", vec![]));
}

fn place_signature(doc: &mut Document, page: ObjectId, raw: &str, at: (f32, f32)) {
    if let Err(err) = embed_signature(doc, page, raw, at) {
        warn!("leaving signature off the report: {err}");
    }
}

fn embed_signature(
    doc: &mut Document,
    page: ObjectId,
    raw: &str,
    (x, y): (f32, f32),
) -> Result<(), SignatureError> {
    let payload = data_uri_payload(raw).ok_or(SignatureError::NotAnImageDataUri)?;
    let bytes = BASE64.decode(payload.as_bytes())?;
    let image = xobject::image_from(bytes)?;
    let width = image.dict.get(b"Width")?.as_i64()? as f32 * SIGNATURE_SCALE;
    let height = image.dict.get(b"Height")?.as_i64()? as f32 * SIGNATURE_SCALE;
    doc.insert_image(page, image, (x, y), (width, height))?;
    Ok(())
}

#[derive(Debug, Error)]
enum SignatureError {
    #[error("signature is not an image data URI")]
    NotAnImageDataUri,
    #[error("signature payload is not valid base64: {0}")]
    Decode(#[from] base64::DecodeError),
    #[error("signature image could not be embedded: {0}")]
    Embed(#[from] lopdf::Error),
}

fn data_uri_payload(raw: &str) -> Option<&str> {
    let rest = raw.strip_prefix("data:image/")?;
    let (_, payload) = rest.split_once(";base64,")?;
    Some(payload)
}

/// What lands on the driver signature line. A captured signature wins: an
/// image data URI is embedded, any other string is drawn verbatim in bold.
/// The roster name stands in when no signature was captured.
enum DriverLine<'a> {
    Image(&'a str),
    Text(&'a str),
}

fn driver_line<'a>(signature: Option<&'a str>, driver_name: &'a str) -> DriverLine<'a> {
    match signature {
        Some(sig) if data_uri_payload(sig).is_some() => DriverLine::Image(sig),
        Some(sig) => DriverLine::Text(sig),
        None => DriverLine::Text(driver_name),
    }
}

fn stop_for<'a>(
    aggregate: &'a TripAggregate,
    stop_id: Option<&str>,
    kind: StopKind,
) -> Option<&'a Stop> {
    if let Some(id) = stop_id {
        if let Some(stop) = aggregate.stops.iter().find(|s| s.id == id) {
            return Some(stop);
        }
    }
    match kind {
        StopKind::Pickup => aggregate
            .stops
            .iter()
            .filter(|s| s.kind == StopKind::Pickup)
            .min_by_key(|s| s.stop_order),
        StopKind::Dropoff => aggregate
            .stops
            .iter()
            .filter(|s| s.kind == StopKind::Dropoff)
            .max_by_key(|s| s.stop_order),
    }
}

/// Print time for a stop row: the recorded arrival when the driver logged
/// one, otherwise the scheduled time.
fn stop_time(stop: &Stop) -> Option<String> {
    stop.arrived_at
        .or(stop.scheduled_at)
        .map(|t| t.format("%I:%M %p").to_string())
}

fn report_path(trip_id: &str, at: DateTime<Utc>) -> String {
    format!(
        "reports/{year}/{month:02}/{day:02}/trip_report_{trip_id}_{millis}.pdf",
        year = at.year(),
        month = at.month(),
        day = at.day(),
        millis = at.timestamp_millis(),
    )
}

fn wrap(text: &str, max_chars: usize) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current = String::new();
    for word in text.split_whitespace() {
        if !current.is_empty() && current.chars().count() + word.chars().count() + 1 > max_chars {
            lines.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(word);
    }
    if !current.is_empty() {
        lines.push(current);
    }
    lines
}
