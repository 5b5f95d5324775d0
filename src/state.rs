use crate::{
    config::AppConfig,
    db::DbPool,
    services::{
        audit::AuditService, billing::BillingService, lifecycle::TripService,
        notify::NotifyService, progress::ProgressService, report::ReportService,
        roster::RosterService,
    },
};

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub db: DbPool,
    pub roster: RosterService,
    pub trips: TripService,
    pub progress: ProgressService,
    pub billing: BillingService,
    pub reports: ReportService,
}

impl AppState {
    pub fn new(config: AppConfig, db: DbPool) -> Self {
        let notify = NotifyService::new(config.notify_webhook.clone());
        let audit = AuditService::new(config.audit_webhook.clone());
        let roster = RosterService::new(db.clone());
        let trips = TripService::new(db.clone(), roster.clone(), audit.clone());
        let progress = ProgressService::new(db.clone(), notify.clone());
        let billing = BillingService::new(db.clone(), audit);
        let reports = ReportService::new(&config, notify);
        Self {
            config,
            db,
            roster,
            trips,
            progress,
            billing,
            reports,
        }
    }
}
