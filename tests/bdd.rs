#![allow(dead_code)]

use std::{fmt, fs::File, net::SocketAddr, path::Path, time::Duration};

use anyhow::Context;
use axum::{
    body::Body,
    http::{header, Request, StatusCode},
};
use chrono::{Datelike, NaiveDate, Utc};
use cucumber::{given, then, when, World as _};
use lopdf::{
    content::{Content, Operation},
    dictionary, Document, Object, Stream,
};
use nemt::{
    config::{AppConfig, ProviderProfile},
    db::init_pool,
    error::AppError,
    models::{
        claim::{Claim, ClaimStatus},
        member::{CreateTripMemberRequest, MemberStatus, SignatureRequest, TripMember},
        stop::{CreateStopRequest, GpsPoint, StopKind},
        trip::{
            CancelTripRequest, CreateTripRequest, NoShowRequest, ReviewStatus, TripAggregate,
            TripStatus, TripType, UpdateTripRequest,
        },
    },
    routes::create_router,
    scope::{ACTOR_HEADER, ORG_HEADER},
    services::report::{RenderedReport, ReportData, TEMPLATE_FILE},
    state::AppState,
};
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::ServiceExt;
use uuid::Uuid;

const DISPATCHER: &str = "dispatcher-1";
const BILLER: &str = "biller-1";
const TINY_PNG_URI: &str = "data:image/png;base64,iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAYAAAAfFcSJAAAADUlEQVR42mNkYPhfDwAChwGA60e6kgAAAABJRU5ErkJggg==";

#[derive(Debug, cucumber::World, Default)]
struct AppWorld {
    state: Option<TestState>,
    org: String,
    driver_id: Option<String>,
    driver_name: Option<String>,
    vehicle_id: Option<String>,
    member_id: Option<String>,
    trip: Option<TripAggregate>,
    second_trip_id: Option<String>,
    generated_claims: Option<Vec<Claim>>,
    rendered: Option<RenderedReport>,
    last_error: Option<AppError>,
}

impl AppWorld {
    fn app_state(&self) -> &AppState {
        self.state
            .as_ref()
            .expect("state must be initialised first")
            .app()
    }

    fn trip_id(&self) -> String {
        self.trip.as_ref().expect("trip must exist").trip.id.clone()
    }

    fn manifest(&self) -> &TripMember {
        self.trip
            .as_ref()
            .expect("trip must exist")
            .members
            .first()
            .expect("trip carries at least one member")
    }

    fn stop_id_for(&self, kind: StopKind) -> String {
        self.trip
            .as_ref()
            .expect("trip must exist")
            .stops
            .iter()
            .find(|stop| stop.kind == kind)
            .expect("stop of requested kind")
            .id
            .clone()
    }

    async fn reload_trip(&mut self) {
        let org = self.org.clone();
        let id = self.trip_id();
        let refreshed = self
            .app_state()
            .trips
            .get_trip(&org, &id)
            .await
            .expect("reload trip");
        self.trip = Some(refreshed);
    }

    fn record<T>(&mut self, result: Result<T, AppError>) -> Option<T> {
        match result {
            Ok(value) => {
                self.last_error = None;
                Some(value)
            }
            Err(err) => {
                self.last_error = Some(err);
                None
            }
        }
    }
}

struct TestState {
    app: AppState,
    _root: TempDir,
}

impl fmt::Debug for TestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestState").finish()
    }
}

impl TestState {
    async fn new() -> anyhow::Result<Self> {
        let root = TempDir::new().context("create temp dir for bdd world")?;
        let asset_root = root.path().join("assets");
        let reports_root = root.path().join("data");
        std::fs::create_dir_all(&asset_root)?;
        std::fs::create_dir_all(&reports_root)?;
        write_blank_template(&asset_root.join(TEMPLATE_FILE))?;

        let db_path = root.path().join("bdd.sqlite");
        File::create(&db_path)?;
        let database_url = format!("sqlite://{}", db_path.to_string_lossy());

        let config = AppConfig {
            database_url: database_url.clone(),
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            asset_root,
            reports_root,
            provider: ProviderProfile {
                name: "Desert Sun Medical Transport".into(),
                provider_id: "000000".into(),
                address: "2402 W Campbell Ave, Phoenix, AZ 85015".into(),
                phone: "(602) 555-0100".into(),
            },
            notify_webhook: None,
            audit_webhook: None,
            render_concurrency: 2,
            render_timeout: Duration::from_secs(10),
        };

        let db = init_pool(&config.database_url).await?;
        sqlx::migrate!("./migrations").run(&db).await?;

        let app = AppState::new(config, db);
        Ok(Self { app, _root: root })
    }

    fn app(&self) -> &AppState {
        &self.app
    }
}

/// Two blank US Letter pages standing in for the deployed agency form.
fn write_blank_template(path: &Path) -> anyhow::Result<()> {
    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let mut kids: Vec<Object> = Vec::new();
    for _ in 0..2 {
        let content = Content {
            operations: vec![Operation::new("q", vec![]), Operation::new("Q", vec![])],
        };
        let content_id = doc.add_object(Stream::new(dictionary! {}, content.encode()?));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
            "Contents" => content_id,
        });
        kids.push(page_id.into());
    }
    let count = kids.len() as i64;
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => count,
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);
    doc.save(path)?;
    Ok(())
}

#[given("a fresh dispatch office")]
async fn given_fresh_state(world: &mut AppWorld) {
    world.state = Some(TestState::new().await.expect("state"));
    world.org = "org-desert-sun".into();
    world.driver_id = None;
    world.driver_name = None;
    world.vehicle_id = None;
    world.member_id = None;
    world.trip = None;
    world.second_trip_id = None;
    world.generated_claims = None;
    world.rendered = None;
    world.last_error = None;
}

#[given(regex = r#"^an active driver \"([^\"]+)\" with a default vehicle$"#)]
async fn given_active_driver(world: &mut AppWorld, name: String) {
    let vehicle_id = seed_vehicle(world).await;
    let driver_id = seed_driver(world, &name, "ACTIVE", Some(&vehicle_id)).await;
    world.vehicle_id = Some(vehicle_id);
    world.driver_id = Some(driver_id);
    world.driver_name = Some(name);
}

#[given(regex = r#"^an inactive driver \"([^\"]+)\"$"#)]
async fn given_inactive_driver(world: &mut AppWorld, name: String) {
    let driver_id = seed_driver(world, &name, "INACTIVE", None).await;
    world.driver_id = Some(driver_id);
    world.driver_name = Some(name);
}

#[given(regex = r#"^an enrolled member \"([^\"]+)\"$"#)]
async fn given_member(world: &mut AppWorld, name: String) {
    world.member_id = Some(seed_member(world, &name).await);
}

#[given(regex = r#"^the driver signs paperwork as \"([^\"]+)\"$"#)]
async fn given_driver_text_signature(world: &mut AppWorld, signature: String) {
    let driver_id = world.driver_id.clone().expect("driver seeded");
    sqlx::query("UPDATE drivers SET signature = ?1 WHERE id = ?2")
        .bind(&signature)
        .bind(&driver_id)
        .execute(&world.app_state().db)
        .await
        .expect("store driver signature");
}

#[given(regex = r"^a trip in status ([A-Z_]+)$")]
async fn given_trip_in_status(world: &mut AppWorld, status: String) {
    advance_to(world, parse_status(&status)).await;
}

#[when("I create a trip with a pickup and a dropoff")]
#[when("I create a trip assigned to the inactive driver")]
async fn when_create_trip(world: &mut AppWorld) {
    create_trip(world).await;
}

#[when("I create a trip with no members")]
async fn when_create_without_members(world: &mut AppWorld) {
    let mut req = base_trip_request(world);
    req.members.clear();
    submit_trip(world, req).await;
}

#[when("I create a trip without a dropoff stop")]
async fn when_create_without_dropoff(world: &mut AppWorld) {
    let mut req = base_trip_request(world);
    req.stops.retain(|stop| stop.kind == StopKind::Pickup);
    submit_trip(world, req).await;
}

#[when("I create a trip without a pickup stop")]
async fn when_create_without_pickup(world: &mut AppWorld) {
    let mut req = base_trip_request(world);
    req.stops.retain(|stop| stop.kind == StopKind::Dropoff);
    submit_trip(world, req).await;
}

#[when("I create a trip with stop orders 1 and 3")]
async fn when_create_with_gapped_orders(world: &mut AppWorld) {
    let mut req = base_trip_request(world);
    req.stops[0].order = Some(1);
    req.stops[1].order = Some(3);
    submit_trip(world, req).await;
}

#[when(regex = r"^I (?:try to )?move the trip to ([A-Z_]+)$")]
async fn when_move_trip(world: &mut AppWorld, status: String) {
    let patch = UpdateTripRequest {
        status: Some(parse_status(&status)),
        ..Default::default()
    };
    let org = world.org.clone();
    let id = world.trip_id();
    let result = world
        .app_state()
        .trips
        .update_trip(&org, &id, DISPATCHER, patch)
        .await;
    if let Some(aggregate) = world.record(result) {
        world.trip = Some(aggregate);
    }
}

#[when(regex = r#"^I change the trip reason to \"([^\"]*)\"$"#)]
async fn when_change_reason(world: &mut AppWorld, reason: String) {
    let patch = UpdateTripRequest {
        reason: Some(reason),
        ..Default::default()
    };
    let org = world.org.clone();
    let id = world.trip_id();
    let result = world
        .app_state()
        .trips
        .update_trip(&org, &id, DISPATCHER, patch)
        .await;
    if let Some(aggregate) = world.record(result) {
        world.trip = Some(aggregate);
    }
}

#[when("I start the trip")]
async fn when_start_trip(world: &mut AppWorld) {
    let org = world.org.clone();
    let id = world.trip_id();
    let result = world.app_state().trips.start_trip(&org, &id).await;
    world.record(result);
    world.reload_trip().await;
}

#[when("I complete the trip")]
async fn when_complete_trip(world: &mut AppWorld) {
    let org = world.org.clone();
    let id = world.trip_id();
    let result = world.app_state().trips.complete_trip(&org, &id).await;
    world.record(result);
    world.reload_trip().await;
}

#[when(regex = r#"^I (?:try to )?cancel the trip with reason \"([^\"]*)\"$"#)]
async fn when_cancel_trip(world: &mut AppWorld, reason: String) {
    let org = world.org.clone();
    let id = world.trip_id();
    let req = CancelTripRequest {
        reason,
        notes: None,
    };
    let result = world
        .app_state()
        .trips
        .cancel_trip(&org, &id, DISPATCHER, req)
        .await;
    world.record(result);
    world.reload_trip().await;
}

#[when("I mark the trip as a no-show after attempting contact")]
async fn when_no_show_with_contact(world: &mut AppWorld) {
    mark_no_show(world, true).await;
}

#[when("I mark the trip as a no-show without attempting contact")]
async fn when_no_show_without_contact(world: &mut AppWorld) {
    mark_no_show(world, false).await;
}

#[when("the biller verifies the trip report")]
async fn when_verify_report(world: &mut AppWorld) {
    let org = world.org.clone();
    let id = world.trip_id();
    let result = world.app_state().trips.verify_report(&org, &id, BILLER).await;
    world.record(result);
    world.reload_trip().await;
}

#[when(regex = r#"^the biller rejects the trip report with reason \"([^\"]+)\"$"#)]
async fn when_reject_report(world: &mut AppWorld, reason: String) {
    let org = world.org.clone();
    let id = world.trip_id();
    let result = world
        .app_state()
        .trips
        .reject_report(&org, &id, BILLER, &reason)
        .await;
    world.record(result);
    world.reload_trip().await;
}

#[then(regex = r"^the trip status is ([A-Z_]+)$")]
async fn then_trip_status(world: &mut AppWorld, status: String) {
    world.reload_trip().await;
    let trip = &world.trip.as_ref().expect("trip must exist").trip;
    assert_eq!(trip.status, parse_status(&status));
}

#[then("the trip records a start time")]
fn then_start_time(world: &mut AppWorld) {
    let trip = &world.trip.as_ref().expect("trip must exist").trip;
    assert!(trip.started_at.is_some());
}

#[then("the trip records a completion time")]
fn then_completion_time(world: &mut AppWorld) {
    let trip = &world.trip.as_ref().expect("trip must exist").trip;
    assert!(trip.completed_at.is_some());
}

#[then(regex = r#"^the cancellation records reason \"([^\"]*)\"$"#)]
async fn then_cancel_reason(world: &mut AppWorld, reason: String) {
    world.reload_trip().await;
    let trip = &world.trip.as_ref().expect("trip must exist").trip;
    assert_eq!(trip.cancel_reason.as_deref(), Some(reason.as_str()));
    assert_eq!(trip.cancelled_by.as_deref(), Some(DISPATCHER));
    assert!(trip.cancelled_at.is_some());
}

#[then("the cancellation notes mention the contact attempt")]
async fn then_contact_attempt_noted(world: &mut AppWorld) {
    world.reload_trip().await;
    let trip = &world.trip.as_ref().expect("trip must exist").trip;
    let notes = trip.cancel_notes.as_deref().expect("no-show notes recorded");
    assert!(notes.contains("Attempted contact: Yes."), "notes were: {notes}");
}

#[then(regex = r"^the trip review status is ([A-Z]+)$")]
fn then_review_status(world: &mut AppWorld, status: String) {
    let trip = &world.trip.as_ref().expect("trip must exist").trip;
    let expected = match status.as_str() {
        "VERIFIED" => ReviewStatus::Verified,
        "REJECTED" => ReviewStatus::Rejected,
        other => panic!("unknown review status {other}"),
    };
    assert_eq!(trip.review_status, Some(expected));
    assert_eq!(trip.reviewed_by.as_deref(), Some(BILLER));
}

#[then(regex = r#"^the rejection reason is recorded as \"([^\"]+)\"$"#)]
fn then_rejection_reason(world: &mut AppWorld, reason: String) {
    let trip = &world.trip.as_ref().expect("trip must exist").trip;
    assert_eq!(
        trip.review_rejection_reason.as_deref(),
        Some(reason.as_str())
    );
}

#[then("the trip has the driver's default vehicle assigned")]
fn then_default_vehicle(world: &mut AppWorld) {
    let trip = &world.trip.as_ref().expect("trip must exist").trip;
    assert_eq!(trip.vehicle_id, world.vehicle_id);
}

#[then("the stops are numbered in the order they were sent")]
fn then_stop_numbering(world: &mut AppWorld) {
    let aggregate = world.trip.as_ref().expect("trip must exist");
    let orders: Vec<i64> = aggregate.stops.iter().map(|s| s.stop_order).collect();
    assert_eq!(orders, vec![1, 2]);
    assert_eq!(aggregate.stops[0].kind, StopKind::Pickup);
    assert_eq!(aggregate.stops[1].kind, StopKind::Dropoff);
}

#[then("the request is rejected as an invalid transition")]
fn then_invalid_transition(world: &mut AppWorld) {
    match world.last_error.take() {
        Some(AppError::InvalidTransition { .. }) => {}
        other => panic!("expected an invalid transition error, got {other:?}"),
    }
}

#[then("the request is rejected because the trip is locked")]
fn then_locked(world: &mut AppWorld) {
    match world.last_error.take() {
        Some(AppError::Locked(_)) => {}
        other => panic!("expected a locked error, got {other:?}"),
    }
}

#[then("the request is rejected as a compliance violation")]
fn then_compliance(world: &mut AppWorld) {
    match world.last_error.take() {
        Some(AppError::ComplianceViolation(_)) => {}
        other => panic!("expected a compliance violation, got {other:?}"),
    }
}

#[then("the request is rejected as a bad request")]
fn then_bad_request(world: &mut AppWorld) {
    match world.last_error.take() {
        Some(AppError::BadRequest(_)) => {}
        other => panic!("expected a bad request error, got {other:?}"),
    }
}

#[then("the request is rejected as not found")]
fn then_not_found(world: &mut AppWorld) {
    match world.last_error.take() {
        Some(AppError::NotFound(_)) => {}
        other => panic!("expected a not found error, got {other:?}"),
    }
}

#[when("the member is marked ready for pickup")]
async fn when_member_ready(world: &mut AppWorld) {
    let org = world.org.clone();
    let trip_id = world.trip_id();
    let entry_id = world.manifest().id.clone();
    let result = world
        .app_state()
        .progress
        .mark_member_ready(&org, &trip_id, &entry_id)
        .await;
    world.record(result);
    world.reload_trip().await;
}

#[when("the driver completes the pickup stop")]
async fn when_complete_pickup(world: &mut AppWorld) {
    complete_stop_of(world, StopKind::Pickup).await;
}

#[when("the driver completes the dropoff stop")]
async fn when_complete_dropoff(world: &mut AppWorld) {
    complete_stop_of(world, StopKind::Dropoff).await;
}

#[when(
    regex = r"^the driver arrives at the pickup stop reporting position (-?\d+\.\d+), (-?\d+\.\d+)$"
)]
async fn when_arrive_with_gps(world: &mut AppWorld, lat: f64, lon: f64) {
    let org = world.org.clone();
    let trip_id = world.trip_id();
    let stop_id = world.stop_id_for(StopKind::Pickup);
    let result = world
        .app_state()
        .progress
        .arrive_at_stop(&org, &trip_id, &stop_id, Some(GpsPoint { lat, lon }))
        .await;
    world.record(result);
    world.reload_trip().await;
}

#[then(regex = r"^the pickup stop records an arrival at (-?\d+\.\d+), (-?\d+\.\d+)$")]
async fn then_arrival_recorded(world: &mut AppWorld, lat: f64, lon: f64) {
    world.reload_trip().await;
    let trip = world.trip.as_ref().expect("trip must exist");
    let stop = trip
        .stops
        .iter()
        .find(|s| s.kind == StopKind::Pickup)
        .expect("pickup stop");
    assert!(stop.arrived_at.is_some());
    assert_eq!(stop.lat, Some(lat));
    assert_eq!(stop.lon, Some(lon));
}

#[then(regex = r"^the member status is ([A-Z_]+)$")]
async fn then_member_status(world: &mut AppWorld, status: String) {
    world.reload_trip().await;
    assert_eq!(world.manifest().status, parse_member_status(&status));
}

#[given("the member signed the trip at dropoff")]
#[when("the member signs the trip at dropoff")]
async fn when_member_signs(world: &mut AppWorld) {
    let req = SignatureRequest {
        signature: TINY_PNG_URI.into(),
        is_proxy_signature: false,
        proxy_signer_name: None,
        proxy_relationship: None,
        proxy_reason: None,
    };
    save_signature(world, req).await;
}

#[when(regex = r#"^a caregiver \"([^\"]+)\" signs for the member because \"([^\"]+)\"$"#)]
async fn when_proxy_signs(world: &mut AppWorld, signer: String, reason: String) {
    let req = SignatureRequest {
        signature: TINY_PNG_URI.into(),
        is_proxy_signature: true,
        proxy_signer_name: Some(signer),
        proxy_relationship: Some("Caregiver".into()),
        proxy_reason: Some(reason),
    };
    save_signature(world, req).await;
}

#[when("an unnamed proxy tries to sign for the member")]
async fn when_unnamed_proxy_signs(world: &mut AppWorld) {
    let req = SignatureRequest {
        signature: TINY_PNG_URI.into(),
        is_proxy_signature: true,
        proxy_signer_name: None,
        proxy_relationship: None,
        proxy_reason: None,
    };
    save_signature(world, req).await;
}

#[then("the manifest entry stores the signature")]
async fn then_signature_stored(world: &mut AppWorld) {
    world.reload_trip().await;
    let entry = world.manifest();
    assert_eq!(entry.signature.as_deref(), Some(TINY_PNG_URI));
    assert!(!entry.is_proxy_signature);
}

#[then(regex = r#"^the manifest entry records proxy signer \"([^\"]+)\"$"#)]
async fn then_proxy_recorded(world: &mut AppWorld, signer: String) {
    world.reload_trip().await;
    let entry = world.manifest();
    assert!(entry.is_proxy_signature);
    assert_eq!(entry.proxy_signer_name.as_deref(), Some(signer.as_str()));
}

#[when("the member submits a multi-megabyte signature upload")]
async fn when_oversized_signature_upload(world: &mut AppWorld) {
    let payload = format!("data:image/png;base64,{}", "A".repeat(3 * 1024 * 1024));
    let body = json!({ "signature": payload }).to_string();
    let trip_id = world.trip_id();
    let entry_id = world.manifest().id.clone();
    let req = Request::builder()
        .method("POST")
        .uri(format!("/trips/{trip_id}/members/{entry_id}/signature"))
        .header(header::CONTENT_TYPE, "application/json")
        .header(ORG_HEADER, world.org.as_str())
        .body(Body::from(body))
        .expect("build request");
    let (status, _) = over_http(world, req).await;
    assert_eq!(status, StatusCode::OK);
}

#[then("the manifest entry holds the oversized signature")]
async fn then_oversized_signature_stored(world: &mut AppWorld) {
    world.reload_trip().await;
    let stored = world
        .manifest()
        .signature
        .as_deref()
        .expect("signature stored");
    assert!(stored.len() > 2 * 1024 * 1024, "signature was truncated");
}

#[given("a second trip in status COMPLETED")]
async fn given_second_completed_trip(world: &mut AppWorld) {
    let first = world.trip.take();
    advance_to(world, TripStatus::Completed).await;
    world.second_trip_id = Some(world.trip_id());
    world.trip = first;
}

#[when("I generate claims for the trip")]
#[when("I generate claims for the trip again")]
async fn when_generate_claims(world: &mut AppWorld) {
    let org = world.org.clone();
    let trip_ids = vec![world.trip_id()];
    let result = world
        .app_state()
        .billing
        .generate_claims_for_trips(&org, Some(BILLER), &trip_ids)
        .await;
    if let Some(claims) = world.record(result) {
        world.generated_claims = Some(claims);
    }
}

#[when("I generate claims for a trip that does not exist")]
async fn when_generate_unknown(world: &mut AppWorld) {
    let org = world.org.clone();
    let trip_ids = vec!["ghost-trip".to_string()];
    let result = world
        .app_state()
        .billing
        .generate_claims_for_trips(&org, Some(BILLER), &trip_ids)
        .await;
    if let Some(claims) = world.record(result) {
        world.generated_claims = Some(claims);
    }
}

#[when("I generate claims for both trips")]
async fn when_generate_claims_batch(world: &mut AppWorld) {
    let org = world.org.clone();
    let trip_ids = vec![
        world.trip_id(),
        world.second_trip_id.clone().expect("second trip seeded"),
    ];
    let result = world
        .app_state()
        .billing
        .generate_claims_for_trips(&org, Some(BILLER), &trip_ids)
        .await;
    if let Some(claims) = world.record(result) {
        world.generated_claims = Some(claims);
    }
}

#[then(regex = r"^(\d+) claims? (?:is|are) returned$")]
fn then_claims_returned(world: &mut AppWorld, expected: usize) {
    let claims = world
        .generated_claims
        .as_ref()
        .expect("claim generation must have run");
    assert_eq!(claims.len(), expected);
}

#[then("the claim number carries the generation instant and a trip handle")]
fn then_claim_number_shape(world: &mut AppWorld) {
    let claim = world
        .generated_claims
        .as_ref()
        .and_then(|claims| claims.first())
        .expect("a claim was generated");
    let mut parts = claim.claim_number.splitn(3, '-');
    assert_eq!(parts.next(), Some("CLM"));
    let millis: i64 = parts
        .next()
        .expect("claim instant")
        .parse()
        .expect("claim instant is epoch millis");
    assert!(millis > 0);
    let handle = parts.next().expect("trip handle");
    assert_eq!(handle, &world.trip_id()[..4]);
}

#[then("every claim carries its own claim number")]
fn then_claim_numbers_distinct(world: &mut AppWorld) {
    let claims = world
        .generated_claims
        .as_ref()
        .expect("claim generation must have run");
    let mut numbers: Vec<&str> = claims.iter().map(|c| c.claim_number.as_str()).collect();
    let total = numbers.len();
    numbers.sort_unstable();
    numbers.dedup();
    assert_eq!(numbers.len(), total, "claim numbers repeat: {numbers:?}");
}

#[then("the claim uses the placeholder procedure code and amount")]
fn then_claim_placeholder(world: &mut AppWorld) {
    let claim = world
        .generated_claims
        .as_ref()
        .and_then(|claims| claims.first())
        .expect("a claim was generated");
    assert_eq!(claim.procedure_code, "A0120");
    assert_eq!(claim.billed_amount_cents, 1500);
    assert_eq!(claim.status, ClaimStatus::Unbilled);
}

#[then("the claim appears in the unbilled queue")]
async fn then_claim_unbilled(world: &mut AppWorld) {
    let org = world.org.clone();
    let trip_id = world.trip_id();
    let queue = world
        .app_state()
        .billing
        .unbilled_claims(&org)
        .await
        .expect("unbilled queue");
    assert!(queue.iter().any(|claim| claim.trip_id == trip_id));
}

#[then(regex = r"^exactly (\d+) claim rows? exists? for the trip$")]
async fn then_claim_rows(world: &mut AppWorld, expected: i64) {
    let trip_id = world.trip_id();
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM claims WHERE trip_id = ?1")
        .bind(trip_id)
        .fetch_one(&world.app_state().db)
        .await
        .expect("count claims");
    assert_eq!(count, expected);
}

#[when("the biller generates claims through the billing endpoint")]
async fn when_generate_over_http(world: &mut AppWorld) {
    let trip_id = world.trip_id();
    let body = json!({ "tripIds": [trip_id] }).to_string();
    let req = Request::builder()
        .method("POST")
        .uri("/billing/generate")
        .header(header::CONTENT_TYPE, "application/json")
        .header(ORG_HEADER, world.org.as_str())
        .header(ACTOR_HEADER, BILLER)
        .body(Body::from(body))
        .expect("build request");
    let (status, bytes) = over_http(world, req).await;
    assert_eq!(status, StatusCode::CREATED);
    let claims: Value = serde_json::from_slice(&bytes).expect("claims json");
    let claims = claims.as_array().expect("claims array");
    assert_eq!(claims.len(), 1);
    assert_eq!(claims[0]["tripId"].as_str(), Some(world.trip_id().as_str()));
}

#[then("the unbilled queue lists the claim at the billing endpoint")]
async fn then_unbilled_over_http(world: &mut AppWorld) {
    let req = Request::builder()
        .method("GET")
        .uri("/billing/unbilled")
        .header(ORG_HEADER, world.org.as_str())
        .body(Body::empty())
        .expect("build request");
    let (status, bytes) = over_http(world, req).await;
    assert_eq!(status, StatusCode::OK);
    let queue: Value = serde_json::from_slice(&bytes).expect("claims json");
    let trip_id = world.trip_id();
    let listed = queue
        .as_array()
        .expect("claims array")
        .iter()
        .any(|claim| claim["tripId"].as_str() == Some(trip_id.as_str()));
    assert!(listed, "claim for {trip_id} missing from the unbilled queue");
}

#[given("the report template has been removed")]
fn given_template_removed(world: &mut AppWorld) {
    let path = world.app_state().reports.template_path();
    std::fs::remove_file(path).expect("remove template");
}

#[when("I download the trip report")]
async fn when_download_report(world: &mut AppWorld) {
    world.reload_trip().await;
    let org = world.org.clone();
    let app = world.app_state().clone();
    let aggregate = world.trip.clone().expect("trip must exist");
    let manifest = aggregate
        .members
        .first()
        .expect("trip carries at least one member")
        .clone();
    let driver = match &aggregate.trip.driver_id {
        Some(id) => Some(app.roster.driver(&org, id).await.expect("driver")),
        None => None,
    };
    let vehicle = match &aggregate.trip.vehicle_id {
        Some(id) => Some(app.roster.vehicle(&org, id).await.expect("vehicle")),
        None => None,
    };
    let member = app
        .roster
        .member(&org, &manifest.member_id)
        .await
        .expect("member");
    let data = ReportData::compose(
        &app.config.provider,
        &aggregate,
        driver.as_ref(),
        vehicle.as_ref(),
        &member,
        &manifest,
    );
    let result = app.reports.generate(data).await;
    if let Some(rendered) = world.record(result) {
        world.rendered = Some(rendered);
    }
}

#[then("the report is a two-page PDF")]
fn then_two_page_pdf(world: &mut AppWorld) {
    let rendered = world.rendered.as_ref().expect("report must have rendered");
    let doc = Document::load_mem(&rendered.bytes).expect("parse rendered pdf");
    assert_eq!(doc.get_pages().len(), 2);
}

#[then("the report embeds the member signature image")]
fn then_signature_embedded(world: &mut AppWorld) {
    let rendered = world.rendered.as_ref().expect("report must have rendered");
    let doc = Document::load_mem(&rendered.bytes).expect("parse rendered pdf");
    assert!(
        count_image_xobjects(&doc) >= 1,
        "no image xobject found in the rendered report"
    );
}

#[then("the report embeds no signature image")]
fn then_no_signature_embedded(world: &mut AppWorld) {
    let rendered = world.rendered.as_ref().expect("report must have rendered");
    let doc = Document::load_mem(&rendered.bytes).expect("parse rendered pdf");
    assert_eq!(count_image_xobjects(&doc), 0);
}

#[then("the report prints the driver name in bold at the signature line")]
fn then_driver_fallback(world: &mut AppWorld) {
    let rendered = world.rendered.as_ref().expect("report must have rendered");
    let doc = Document::load_mem(&rendered.bytes).expect("parse rendered pdf");
    let (bold_used, texts) = page_two_marks(&doc);
    assert!(bold_used, "no bold font selected on the second page");
    let driver_name = world.driver_name.as_deref().expect("driver seeded");
    assert!(
        texts.iter().any(|t| t == driver_name),
        "driver name {driver_name} not drawn on the second page: {texts:?}"
    );
}

#[then(regex = r#"^the report signs the driver line with \"([^\"]+)\" in bold$"#)]
fn then_driver_text_signature_drawn(world: &mut AppWorld, signature: String) {
    let rendered = world.rendered.as_ref().expect("report must have rendered");
    let doc = Document::load_mem(&rendered.bytes).expect("parse rendered pdf");
    let (bold_used, texts) = page_two_marks(&doc);
    assert!(bold_used, "no bold font selected on the second page");
    assert!(
        texts.iter().any(|t| t == &signature),
        "signature {signature} not drawn on the second page: {texts:?}"
    );
    let driver_name = world.driver_name.as_deref().expect("driver seeded");
    assert!(
        !texts.iter().any(|t| t == driver_name),
        "roster name {driver_name} drawn although a signature was captured"
    );
}

#[then("the report file lands under today's reports folder")]
fn then_report_on_disk(world: &mut AppWorld) {
    let rendered = world.rendered.as_ref().expect("report must have rendered");
    let now = Utc::now();
    let prefix = format!(
        "reports/{}/{:02}/{:02}/trip_report_{}_",
        now.year(),
        now.month(),
        now.day(),
        world.trip_id()
    );
    assert!(
        rendered.relative_path.starts_with(&prefix),
        "unexpected report path {}",
        rendered.relative_path
    );
    assert!(rendered.relative_path.ends_with(".pdf"));
    let on_disk = world
        .app_state()
        .config
        .reports_root
        .join(&rendered.relative_path);
    assert!(on_disk.is_file(), "report missing at {}", on_disk.display());
}

#[then("the request is rejected because the template is missing")]
fn then_template_missing(world: &mut AppWorld) {
    match world.last_error.take() {
        Some(AppError::TemplateNotFound(_)) => {}
        other => panic!("expected a template-not-found error, got {other:?}"),
    }
}

async fn seed_vehicle(world: &AppWorld) -> String {
    let id = Uuid::new_v4().to_string();
    sqlx::query(
        "INSERT INTO vehicles (id, org_id, identifier, color, make, model, vehicle_type, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
    )
    .bind(&id)
    .bind(&world.org)
    .bind("VAN-12")
    .bind("White")
    .bind("Ford")
    .bind("Transit")
    .bind("VAN")
    .bind(Utc::now())
    .execute(&world.app_state().db)
    .await
    .expect("seed vehicle");
    id
}

async fn seed_driver(
    world: &AppWorld,
    name: &str,
    status: &str,
    default_vehicle_id: Option<&str>,
) -> String {
    let id = Uuid::new_v4().to_string();
    sqlx::query(
        "INSERT INTO drivers (id, org_id, full_name, status, default_vehicle_id, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
    )
    .bind(&id)
    .bind(&world.org)
    .bind(name)
    .bind(status)
    .bind(default_vehicle_id)
    .bind(Utc::now())
    .execute(&world.app_state().db)
    .await
    .expect("seed driver");
    id
}

async fn seed_member(world: &AppWorld, name: &str) -> String {
    let id = Uuid::new_v4().to_string();
    let (first, last) = name.split_once(' ').unwrap_or((name, ""));
    sqlx::query(
        "INSERT INTO members (id, org_id, external_id, first_name, last_name, date_of_birth, address, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
    )
    .bind(&id)
    .bind(&world.org)
    .bind("A12345678")
    .bind(first)
    .bind(last)
    .bind(NaiveDate::from_ymd_opt(1951, 3, 7).expect("valid date"))
    .bind("1200 N 7th St, Phoenix, AZ 85006")
    .bind(Utc::now())
    .execute(&world.app_state().db)
    .await
    .expect("seed member");
    id
}

fn base_trip_request(world: &AppWorld) -> CreateTripRequest {
    CreateTripRequest {
        trip_date: Utc::now().date_naive(),
        trip_type: TripType::RoundTrip,
        driver_id: world.driver_id.clone(),
        vehicle_id: None,
        carpool: false,
        mobility: Some("AMBULATORY".into()),
        reason: Some("dialysis appointment".into()),
        notes: Some("call on arrival".into()),
        stops: vec![
            CreateStopRequest {
                kind: StopKind::Pickup,
                address: "1200 N 7th St, Phoenix, AZ 85006".into(),
                order: None,
                lat: None,
                lon: None,
                scheduled_at: Some(Utc::now()),
            },
            CreateStopRequest {
                kind: StopKind::Dropoff,
                address: "Desert Kidney Center, 4405 E Thomas Rd".into(),
                order: None,
                lat: None,
                lon: None,
                scheduled_at: None,
            },
        ],
        members: vec![CreateTripMemberRequest {
            member_id: world.member_id.clone().expect("member seeded"),
            pickup_stop_order: None,
            dropoff_stop_order: None,
        }],
    }
}

async fn submit_trip(world: &mut AppWorld, req: CreateTripRequest) {
    let org = world.org.clone();
    let result = world
        .app_state()
        .trips
        .create_trip(&org, DISPATCHER, req)
        .await;
    if let Some(aggregate) = world.record(result) {
        world.trip = Some(aggregate);
    }
}

async fn create_trip(world: &mut AppWorld) {
    let req = base_trip_request(world);
    submit_trip(world, req).await;
}

async fn advance_to(world: &mut AppWorld, status: TripStatus) {
    create_trip(world).await;
    assert!(
        world.last_error.is_none(),
        "trip creation failed: {:?}",
        world.last_error
    );
    let org = world.org.clone();
    let id = world.trip_id();
    let app = world.app_state().clone();
    match status {
        TripStatus::PendingApproval => {}
        TripStatus::Scheduled => {
            patch_status(&app, &org, &id, TripStatus::Scheduled).await;
        }
        TripStatus::InProgress => {
            patch_status(&app, &org, &id, TripStatus::Scheduled).await;
            app.trips.start_trip(&org, &id).await.expect("start trip");
        }
        TripStatus::WaitingForClients => {
            patch_status(&app, &org, &id, TripStatus::Scheduled).await;
            app.trips.start_trip(&org, &id).await.expect("start trip");
            patch_status(&app, &org, &id, TripStatus::WaitingForClients).await;
        }
        TripStatus::Completed => {
            patch_status(&app, &org, &id, TripStatus::Scheduled).await;
            app.trips.start_trip(&org, &id).await.expect("start trip");
            app.trips
                .complete_trip(&org, &id)
                .await
                .expect("complete trip");
        }
        TripStatus::Finalized => {
            patch_status(&app, &org, &id, TripStatus::Scheduled).await;
            app.trips.start_trip(&org, &id).await.expect("start trip");
            app.trips
                .complete_trip(&org, &id)
                .await
                .expect("complete trip");
            patch_status(&app, &org, &id, TripStatus::Finalized).await;
        }
        TripStatus::Cancelled => {
            patch_status(&app, &org, &id, TripStatus::Scheduled).await;
            app.trips
                .cancel_trip(
                    &org,
                    &id,
                    DISPATCHER,
                    CancelTripRequest {
                        reason: "member request".into(),
                        notes: None,
                    },
                )
                .await
                .expect("cancel trip");
        }
        TripStatus::NoShow => {
            patch_status(&app, &org, &id, TripStatus::Scheduled).await;
            app.trips
                .mark_no_show(
                    &org,
                    &id,
                    DISPATCHER,
                    NoShowRequest {
                        notes: None,
                        attempted_contact: false,
                    },
                )
                .await
                .expect("mark no-show");
        }
    }
    world.reload_trip().await;
}

async fn patch_status(app: &AppState, org: &str, id: &str, status: TripStatus) {
    let patch = UpdateTripRequest {
        status: Some(status),
        ..Default::default()
    };
    app.trips
        .update_trip(org, id, DISPATCHER, patch)
        .await
        .expect("patch trip status");
}

async fn mark_no_show(world: &mut AppWorld, attempted_contact: bool) {
    let org = world.org.clone();
    let id = world.trip_id();
    let req = NoShowRequest {
        notes: Some("no answer at the door".into()),
        attempted_contact,
    };
    let result = world
        .app_state()
        .trips
        .mark_no_show(&org, &id, DISPATCHER, req)
        .await;
    world.record(result);
    world.reload_trip().await;
}

async fn complete_stop_of(world: &mut AppWorld, kind: StopKind) {
    let org = world.org.clone();
    let trip_id = world.trip_id();
    let stop_id = world.stop_id_for(kind);
    let result = world
        .app_state()
        .progress
        .complete_stop(&org, &trip_id, &stop_id, Some(126_043.7))
        .await;
    world.record(result);
    world.reload_trip().await;
}

async fn save_signature(world: &mut AppWorld, req: SignatureRequest) {
    let org = world.org.clone();
    let trip_id = world.trip_id();
    let entry_id = world.manifest().id.clone();
    let result = world
        .app_state()
        .progress
        .save_member_signature(&org, &trip_id, &entry_id, req)
        .await;
    world.record(result);
    world.reload_trip().await;
}

async fn over_http(world: &AppWorld, req: Request<Body>) -> (StatusCode, Vec<u8>) {
    let router = create_router(world.app_state().clone());
    let response = router.oneshot(req).await.expect("route request");
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("read response body");
    (status, bytes.to_vec())
}

fn parse_status(word: &str) -> TripStatus {
    match word {
        "PENDING_APPROVAL" => TripStatus::PendingApproval,
        "SCHEDULED" => TripStatus::Scheduled,
        "IN_PROGRESS" => TripStatus::InProgress,
        "WAITING_FOR_CLIENTS" => TripStatus::WaitingForClients,
        "COMPLETED" => TripStatus::Completed,
        "FINALIZED" => TripStatus::Finalized,
        "CANCELLED" => TripStatus::Cancelled,
        "NO_SHOW" => TripStatus::NoShow,
        other => panic!("unknown trip status {other}"),
    }
}

fn parse_member_status(word: &str) -> MemberStatus {
    match word {
        "SCHEDULED" => MemberStatus::Scheduled,
        "READY_FOR_PICKUP" => MemberStatus::ReadyForPickup,
        "PICKED_UP" => MemberStatus::PickedUp,
        "DROPPED_OFF" => MemberStatus::DroppedOff,
        "COMPLETED" => MemberStatus::Completed,
        other => panic!("unknown member status {other}"),
    }
}

fn count_image_xobjects(doc: &Document) -> usize {
    doc.objects
        .values()
        .filter(|object| match object {
            Object::Stream(stream) => stream
                .dict
                .get(b"Subtype")
                .ok()
                .and_then(|subtype| subtype.as_name().ok())
                .map(|name| name == b"Image".as_slice())
                .unwrap_or(false),
            _ => false,
        })
        .count()
}

fn page_two_marks(doc: &Document) -> (bool, Vec<String>) {
    let pages = doc.get_pages();
    let page_id = *pages.get(&2).expect("second page");
    let raw = doc.get_page_content(page_id).expect("page content");
    let content = Content::decode(&raw).expect("decode page content");
    let mut bold_used = false;
    let mut texts = Vec::new();
    for op in &content.operations {
        match op.operator.as_str() {
            "Tf" => {
                if let Some(Object::Name(name)) = op.operands.first() {
                    if name.as_slice() == b"TrHelvB" {
                        bold_used = true;
                    }
                }
            }
            "Tj" => {
                if let Some(Object::String(bytes, _)) = op.operands.first() {
                    texts.push(String::from_utf8_lossy(bytes).to_string());
                }
            }
            _ => {}
        }
    }
    (bold_used, texts)
}

#[tokio::main]
async fn main() {
    AppWorld::cucumber()
        .fail_on_skipped()
        .with_default_cli()
        .run("tests/features")
        .await;
}
