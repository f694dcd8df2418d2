//! Per-period, per-family synchronization for one session.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use taxmirror_adapters::parser::{
    aggregate_record, daily_records, document_records, form_records, receipt_records,
};
use taxmirror_adapters::{
    ContributorInfo, ExtractionPlan, GranularityPolicy, ParsedPayload, PortalAdapter, PortalError,
    PortalRequest,
};
use taxmirror_core::{DocumentFamily, DocumentRecord, Session, SyncPeriod};
use taxmirror_storage::{UpsertEngine, UpsertOutcome};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::cache::OrchestratorCache;
use crate::periods::{last_n_months, last_n_years, Clock, SystemClock, MAX_MONTHS_BACK, MAX_YEARS_BACK};
use crate::SyncError;

/// Form code listed by [`SyncOrchestrator::sync_forms`].
pub const MONTHLY_DECLARATION_FORM: &str = "F29";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FamilyTotals {
    pub purchase: UpsertOutcome,
    pub sale: UpsertOutcome,
    pub receipt: UpsertOutcome,
}

impl FamilyTotals {
    pub fn get(&self, family: DocumentFamily) -> UpsertOutcome {
        match family {
            DocumentFamily::Purchase => self.purchase,
            DocumentFamily::Sale => self.sale,
            DocumentFamily::Receipt => self.receipt,
        }
    }

    fn get_mut(&mut self, family: DocumentFamily) -> &mut UpsertOutcome {
        match family {
            DocumentFamily::Purchase => &mut self.purchase,
            DocumentFamily::Sale => &mut self.sale,
            DocumentFamily::Receipt => &mut self.receipt,
        }
    }

    pub fn overall(&self) -> UpsertOutcome {
        let mut sum = self.purchase;
        sum += self.sale;
        sum += self.receipt;
        sum
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeriodFailure {
    pub period: String,
    pub family: DocumentFamily,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub run_id: Uuid,
    pub session_id: Uuid,
    pub entity_id: Uuid,
    pub months_back: usize,
    pub totals: FamilyTotals,
    pub periods: Vec<String>,
    pub periods_processed: usize,
    pub errors: Vec<PeriodFailure>,
    pub cancelled: bool,
    pub duration_seconds: f64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct YearFailure {
    pub year: i32,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct FormSyncReport {
    pub session_id: Uuid,
    pub entity_id: Uuid,
    pub form_code: String,
    pub years: Vec<i32>,
    pub totals: UpsertOutcome,
    pub errors: Vec<YearFailure>,
    pub cancelled: bool,
    pub duration_seconds: f64,
}

#[derive(Clone)]
pub struct SyncOrchestrator {
    adapter: PortalAdapter,
    upserts: UpsertEngine,
    policy: GranularityPolicy,
    clock: Arc<dyn Clock>,
}

impl SyncOrchestrator {
    pub fn new(adapter: PortalAdapter, upserts: UpsertEngine) -> Self {
        Self {
            adapter,
            upserts,
            policy: GranularityPolicy::default(),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_policy(mut self, policy: GranularityPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn adapter(&self) -> &PortalAdapter {
        &self.adapter
    }

    pub fn upserts(&self) -> &UpsertEngine {
        &self.upserts
    }

    async fn load_session(&self, session_id: Uuid) -> Result<Session, SyncError> {
        match self.adapter.credentials().get(session_id).await {
            Ok(session) if session.active => Ok(session),
            Ok(_) => Err(SyncError::SessionNotFound(session_id)),
            Err(err) if err.is_not_found() => Err(SyncError::SessionNotFound(session_id)),
            Err(err) => Err(SyncError::Store(err)),
        }
    }

    /// Sync the last `months_back` periods. Family failures are collected in the
    /// report; only a missing session or an unreachable portal fail the call.
    pub async fn sync(
        &self,
        session_id: Uuid,
        months_back: usize,
        cancel: &CancellationToken,
    ) -> Result<SyncReport, SyncError> {
        let started_at = Utc::now();
        let clock_start = Instant::now();
        let session = self.load_session(session_id).await?;
        let entity_id = session.entity_id;
        if months_back > MAX_MONTHS_BACK {
            warn!(months_back, max = MAX_MONTHS_BACK, "sync window clamped");
        }
        let periods = last_n_months(months_back, self.clock.today());
        info!(%session_id, %entity_id, periods = periods.len(), "starting document sync");

        let mut totals = FamilyTotals::default();
        let mut errors = Vec::new();
        let mut periods_processed = 0usize;
        let mut cancelled = false;
        let mut attempts = 0usize;
        let mut unavailable = 0usize;

        'periods: for period in &periods {
            for family in DocumentFamily::ALL {
                if cancel.is_cancelled() {
                    cancelled = true;
                    break 'periods;
                }
                let span = info_span!("sync_family", period = %period, family = family.as_str());
                attempts += 1;
                match self
                    .sync_family(session_id, entity_id, family, *period)
                    .instrument(span)
                    .await
                {
                    Ok(outcome) => {
                        totals.get_mut(family).absorb(outcome);
                    }
                    Err(PortalError::SessionNotFound(id)) => return Err(SyncError::SessionNotFound(id)),
                    Err(err) => {
                        if matches!(err, PortalError::Unavailable(_)) {
                            unavailable += 1;
                        }
                        warn!(period = %period, family = family.as_str(), error = %err, "family sync failed");
                        errors.push(PeriodFailure {
                            period: period.code(),
                            family,
                            error: err.to_string(),
                        });
                    }
                }
            }
            periods_processed += 1;
            if periods_processed == 1 && unavailable == attempts {
                let reason = errors
                    .last()
                    .map(|e| e.error.clone())
                    .unwrap_or_else(|| "no family reached the portal".to_string());
                return Err(SyncError::PortalUnavailable(reason));
            }
        }

        let finished_at = Utc::now();
        let report = SyncReport {
            run_id: Uuid::new_v4(),
            session_id,
            entity_id,
            months_back,
            totals,
            periods: periods.iter().map(SyncPeriod::code).collect(),
            periods_processed,
            errors,
            cancelled,
            duration_seconds: clock_start.elapsed().as_secs_f64(),
            started_at,
            finished_at,
        };
        let overall = report.totals.overall();
        info!(
            %session_id,
            total = overall.total,
            new = overall.new,
            updated = overall.updated,
            failures = report.errors.len(),
            cancelled,
            "document sync finished"
        );
        Ok(report)
    }

    async fn fetch(&self, session_id: Uuid, request: PortalRequest) -> Result<ParsedPayload, PortalError> {
        self.adapter.fetch_parsed(session_id, &request).await
    }

    fn unexpected(parsed: &ParsedPayload, wanted: &str) -> PortalError {
        PortalError::Extraction(format!("expected {wanted} payload, got {}", parsed.kind()))
    }

    async fn sync_family(
        &self,
        session_id: Uuid,
        entity_id: Uuid,
        family: DocumentFamily,
        period: SyncPeriod,
    ) -> Result<UpsertOutcome, PortalError> {
        let rows = match family {
            DocumentFamily::Receipt => match self.fetch(session_id, PortalRequest::Receipts { period }).await? {
                ParsedPayload::Receipts(raw) => receipt_records(entity_id, period, raw),
                other => return Err(Self::unexpected(&other, "receipts")),
            },
            DocumentFamily::Purchase | DocumentFamily::Sale => {
                self.collect_summarized(session_id, entity_id, family, period).await?
            }
        };
        self.upserts
            .upsert_documents(rows)
            .await
            .map_err(PortalError::Store)
    }

    /// Walk the period summary and gather rows at the granularity each entry calls for.
    async fn collect_summarized(
        &self,
        session_id: Uuid,
        entity_id: Uuid,
        family: DocumentFamily,
        period: SyncPeriod,
    ) -> Result<Vec<DocumentRecord>, PortalError> {
        let entries = match self.fetch(session_id, PortalRequest::Summary { family, period }).await? {
            ParsedPayload::Summary(entries) => entries,
            other => return Err(Self::unexpected(&other, "summary")),
        };

        let mut rows = Vec::new();
        for entry in &entries {
            let document_type = entry.document_type.clone();
            match self.policy.resolve(entry) {
                ExtractionPlan::Skip => {}
                ExtractionPlan::MonthlyAggregate => {
                    rows.push(aggregate_record(entity_id, family, period, entry));
                }
                ExtractionPlan::Daily { with_aggregate } => {
                    let request = PortalRequest::DailyTotals {
                        family,
                        period,
                        document_type: document_type.clone(),
                    };
                    match self.fetch(session_id, request).await? {
                        ParsedPayload::DailyTotals(days) => {
                            rows.extend(daily_records(entity_id, family, period, &document_type, days)?);
                        }
                        other => return Err(Self::unexpected(&other, "daily totals")),
                    }
                    if with_aggregate {
                        rows.push(aggregate_record(entity_id, family, period, entry));
                    }
                }
                ExtractionPlan::Detail => {
                    let request = PortalRequest::Documents {
                        family,
                        period,
                        document_type: document_type.clone(),
                    };
                    match self.fetch(session_id, request).await? {
                        ParsedPayload::Documents(raw) => {
                            rows.extend(document_records(entity_id, family, period, &document_type, raw));
                        }
                        other => return Err(Self::unexpected(&other, "documents")),
                    }
                }
            }
        }
        Ok(rows)
    }

    /// List monthly declarations for the last `years_back` years and upsert them.
    pub async fn sync_forms(
        &self,
        session_id: Uuid,
        years_back: usize,
        cancel: &CancellationToken,
    ) -> Result<FormSyncReport, SyncError> {
        let clock_start = Instant::now();
        let session = self.load_session(session_id).await?;
        let entity_id = session.entity_id;
        if years_back > MAX_YEARS_BACK {
            warn!(years_back, max = MAX_YEARS_BACK, "form window clamped");
        }
        let years = last_n_years(years_back, self.clock.today());

        let mut totals = UpsertOutcome::default();
        let mut errors = Vec::new();
        let mut cancelled = false;
        for year in &years {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            let request = PortalRequest::FormList {
                form_code: MONTHLY_DECLARATION_FORM.to_string(),
                year: *year,
            };
            let result: Result<UpsertOutcome, PortalError> = async {
                let forms = match self.fetch(session_id, request).await? {
                    ParsedPayload::Forms(forms) => forms,
                    other => return Err(Self::unexpected(&other, "form list")),
                };
                let records = form_records(entity_id, MONTHLY_DECLARATION_FORM, forms)?;
                self.upserts.upsert_forms(records).await.map_err(PortalError::Store)
            }
            .instrument(info_span!("sync_forms", year = *year))
            .await;

            match result {
                Ok(outcome) => totals.absorb(outcome),
                Err(PortalError::SessionNotFound(id)) => return Err(SyncError::SessionNotFound(id)),
                Err(err) => {
                    warn!(year = *year, error = %err, "form list sync failed");
                    errors.push(YearFailure {
                        year: *year,
                        error: err.to_string(),
                    });
                }
            }
        }

        Ok(FormSyncReport {
            session_id,
            entity_id,
            form_code: MONTHLY_DECLARATION_FORM.to_string(),
            years,
            totals,
            errors,
            cancelled,
            duration_seconds: clock_start.elapsed().as_secs_f64(),
        })
    }

    pub async fn contributor_info(&self, session_id: Uuid) -> Result<ContributorInfo, SyncError> {
        self.load_session(session_id).await?;
        match self.fetch(session_id, PortalRequest::ContributorInfo).await {
            Ok(ParsedPayload::Contributor(info)) => Ok(info),
            Ok(other) => Err(SyncError::Portal(Self::unexpected(&other, "contributor"))),
            Err(PortalError::SessionNotFound(id)) => Err(SyncError::SessionNotFound(id)),
            Err(err) => Err(SyncError::Portal(err)),
        }
    }
}

#[derive(Debug)]
pub struct SessionSyncResult {
    pub session_id: Uuid,
    pub entity_id: Uuid,
    pub result: Result<SyncReport, SyncError>,
}

/// Sync independent sessions concurrently, one task per session. Each session
/// runs its periods and families sequentially.
pub async fn sync_many<F>(
    cache: &OrchestratorCache,
    build: F,
    sessions: &[Session],
    months_back: usize,
    cancel: &CancellationToken,
) -> Vec<SessionSyncResult>
where
    F: Fn(Uuid) -> SyncOrchestrator,
{
    let mut tasks = JoinSet::new();
    for session in sessions {
        let orchestrator = cache.get_or_insert_with(session.entity_id, || build(session.entity_id));
        let cancel = cancel.clone();
        let session_id = session.id;
        let entity_id = session.entity_id;
        tasks.spawn(async move {
            let result = orchestrator.sync(session_id, months_back, &cancel).await;
            SessionSyncResult {
                session_id,
                entity_id,
                result,
            }
        });
    }

    let mut results = Vec::with_capacity(sessions.len());
    let mut task_failures = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(outcome) => {
                if matches!(outcome.result, Err(SyncError::SessionNotFound(_))) {
                    cache.clear(outcome.entity_id);
                }
                results.push(outcome);
            }
            Err(err) => {
                warn!(error = %err, "session sync task failed to complete");
                task_failures.push(err.to_string());
            }
        }
    }

    // A failed task carries no session id; every session without a result is one of them.
    if !task_failures.is_empty() {
        let reported: HashSet<Uuid> = results.iter().map(|r| r.session_id).collect();
        let detail = task_failures.join("; ");
        for session in sessions.iter().filter(|s| !reported.contains(&s.id)) {
            cache.clear(session.entity_id);
            results.push(SessionSyncResult {
                session_id: session.id,
                entity_id: session.entity_id,
                result: Err(SyncError::TaskFailed(detail.clone())),
            });
        }
    }
    results.sort_by_key(|r| r.session_id);
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    use chrono::NaiveDate;
    use serde_json::json;
    use taxmirror_adapters::{CallOutcome, PortalAutomation, PortalPayload};
    use taxmirror_core::{Cookie, Granularity, PortalCredentials};
    use taxmirror_storage::{CredentialStore, DocumentStore, MemoryCredentialStore, MemoryDocumentStore};

    use crate::periods::FixedClock;

    /// Serves payloads keyed by request; requests listed in `failing` error out.
    struct MapAutomation {
        replies: HashMap<String, serde_json::Value>,
        failing: Mutex<HashMap<String, PortalError>>,
    }

    fn key(request: &PortalRequest) -> String {
        serde_json::to_string(request).unwrap()
    }

    impl PortalAutomation for MapAutomation {
        fn login(&self, _c: &PortalCredentials) -> Result<Vec<Cookie>, PortalError> {
            Ok(vec![
                Cookie::new("A", "1", "p"),
                Cookie::new("B", "2", "p"),
                Cookie::new("C", "3", "p"),
            ])
        }

        fn is_session_valid(&self, _c: &[Cookie]) -> Result<bool, PortalError> {
            Ok(true)
        }

        fn execute(&self, request: &PortalRequest, cookies: &[Cookie]) -> CallOutcome {
            let k = key(request);
            let result = if let Some(err) = self.failing.lock().unwrap().remove(&k) {
                Err(err)
            } else {
                self.replies
                    .get(&k)
                    .cloned()
                    .map(PortalPayload::Json)
                    .ok_or_else(|| PortalError::Extraction(format!("no reply for {k}")))
            };
            CallOutcome {
                result,
                cookies: cookies.to_vec(),
            }
        }
    }

    fn period(y: i32, m: u32) -> SyncPeriod {
        SyncPeriod::new(y, m).unwrap()
    }

    fn empty_month(replies: &mut HashMap<String, serde_json::Value>, p: SyncPeriod) {
        for family in [DocumentFamily::Purchase, DocumentFamily::Sale] {
            replies.insert(key(&PortalRequest::Summary { family, period: p }), json!({"entries": []}));
        }
        replies.insert(key(&PortalRequest::Receipts { period: p }), json!({"receipts": []}));
    }

    fn october_replies() -> HashMap<String, serde_json::Value> {
        let p = period(2024, 10);
        let mut replies = HashMap::new();
        empty_month(&mut replies, period(2024, 9));
        replies.insert(
            key(&PortalRequest::Summary { family: DocumentFamily::Purchase, period: p }),
            json!({"entries": [
                {"document_type": "33", "document_count": 2, "total_amount": 2380},
                {"document_type": "39", "document_count": 40, "total_amount": 9000,
                 "aggregated": true, "has_detail": false},
                {"document_type": "35", "document_count": 4, "total_amount": 400,
                 "aggregated": true, "has_detail": false}
            ]}),
        );
        replies.insert(
            key(&PortalRequest::Documents {
                family: DocumentFamily::Purchase,
                period: p,
                document_type: "33".into(),
            }),
            json!({"documents": [
                {"folio": "100", "counterparty_rut": "76.123.456-K", "total_amount": 1190},
                {"folio": "101", "counterparty_rut": "76.123.456-K", "total_amount": 1190}
            ]}),
        );
        replies.insert(
            key(&PortalRequest::DailyTotals {
                family: DocumentFamily::Purchase,
                period: p,
                document_type: "39".into(),
            }),
            json!({"days": [
                {"date": "2024-10-01", "total_amount": 4000},
                {"date": "2024-10-02", "total_amount": 3000},
                {"date": "2024-10-03", "total_amount": 2000}
            ]}),
        );
        replies.insert(
            key(&PortalRequest::Summary { family: DocumentFamily::Sale, period: p }),
            json!({"entries": [{"document_type": "33", "document_count": 1, "total_amount": 500}]}),
        );
        replies.insert(
            key(&PortalRequest::Documents {
                family: DocumentFamily::Sale,
                period: p,
                document_type: "33".into(),
            }),
            json!({"documents": [{"folio": 7, "counterparty_rut": "11.111.111-1", "total_amount": 500}]}),
        );
        replies.insert(
            key(&PortalRequest::Receipts { period: p }),
            json!({"receipts": [{"folio": 1, "issuer_rut": "12.345.678-5", "gross_amount": 1000,
                                 "retention_amount": 137, "net_amount": 863}]}),
        );
        replies
    }

    struct Harness {
        orchestrator: SyncOrchestrator,
        documents: Arc<MemoryDocumentStore>,
        session: Session,
    }

    fn harness(replies: HashMap<String, serde_json::Value>, failing: HashMap<String, PortalError>) -> Harness {
        let session = Session::new(
            Uuid::new_v4(),
            PortalCredentials {
                rut: "76543210-3".into(),
                password: "pw".into(),
            },
        );
        let credentials: Arc<dyn CredentialStore> = Arc::new(MemoryCredentialStore::with_sessions([session.clone()]));
        let automation = Arc::new(MapAutomation {
            replies,
            failing: Mutex::new(failing),
        });
        let documents = Arc::new(MemoryDocumentStore::new());
        let orchestrator = SyncOrchestrator::new(
            PortalAdapter::new(automation, credentials),
            UpsertEngine::new(documents.clone()),
        )
        .with_clock(Arc::new(FixedClock(NaiveDate::from_ymd_opt(2024, 10, 20).unwrap())));
        Harness {
            orchestrator,
            documents,
            session,
        }
    }

    #[tokio::test]
    async fn daily_capable_aggregates_persist_daily_rows_only() {
        let h = harness(october_replies(), HashMap::new());
        let report = h
            .orchestrator
            .sync(h.session.id, 2, &CancellationToken::new())
            .await
            .expect("sync");
        assert!(report.errors.is_empty(), "{:?}", report.errors);
        assert_eq!(report.periods, ["202409", "202410"]);
        assert_eq!(report.totals.purchase.total, 6);
        assert_eq!(report.totals.sale.new, 1);
        assert_eq!(report.totals.receipt.new, 1);

        let docs = h.documents.list_documents(h.session.entity_id).await.unwrap();
        let purchases: Vec<_> = docs.iter().filter(|d| d.family == DocumentFamily::Purchase).collect();
        assert_eq!(purchases.iter().filter(|d| d.document_type == "33").count(), 2);
        let type_39: Vec<_> = purchases.iter().filter(|d| d.document_type == "39").collect();
        assert_eq!(type_39.len(), 3);
        assert!(type_39.iter().all(|d| d.granularity == Granularity::Daily));
        let type_35: Vec<_> = purchases.iter().filter(|d| d.document_type == "35").collect();
        assert_eq!(type_35.len(), 1);
        assert_eq!(type_35[0].granularity, Granularity::MonthlyAggregate);
        assert_eq!(type_35[0].folio, "AGG-202410-35");
    }

    #[tokio::test]
    async fn rerun_reports_updates_not_inserts() {
        let h = harness(october_replies(), HashMap::new());
        let cancel = CancellationToken::new();
        h.orchestrator.sync(h.session.id, 2, &cancel).await.unwrap();
        let second = h.orchestrator.sync(h.session.id, 2, &cancel).await.unwrap();
        assert_eq!(second.totals.overall().new, 0);
        assert_eq!(second.totals.overall().updated, 8);
        assert_eq!(h.documents.document_count().await, 8);
    }

    #[tokio::test]
    async fn failing_family_does_not_stop_the_rest() {
        let mut failing = HashMap::new();
        failing.insert(
            key(&PortalRequest::Summary {
                family: DocumentFamily::Sale,
                period: period(2024, 10),
            }),
            PortalError::Extraction("sales table missing".into()),
        );
        let h = harness(october_replies(), failing);
        let report = h
            .orchestrator
            .sync(h.session.id, 2, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(
            report.errors,
            vec![PeriodFailure {
                period: "202410".into(),
                family: DocumentFamily::Sale,
                error: "extraction failed: sales table missing".into(),
            }]
        );
        assert_eq!(report.totals.purchase.total, 6);
        assert_eq!(report.totals.receipt.total, 1);
        assert_eq!(report.totals.sale.total, 0);
        assert_eq!(report.periods_processed, 2);
    }

    #[tokio::test]
    async fn missing_session_fails_the_whole_sync() {
        let h = harness(october_replies(), HashMap::new());
        let err = h
            .orchestrator
            .sync(Uuid::new_v4(), 1, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn unreachable_portal_fails_the_whole_sync() {
        let p = period(2024, 10);
        let mut failing = HashMap::new();
        for request in [
            PortalRequest::Summary { family: DocumentFamily::Purchase, period: p },
            PortalRequest::Summary { family: DocumentFamily::Sale, period: p },
            PortalRequest::Receipts { period: p },
        ] {
            failing.insert(key(&request), PortalError::Unavailable("connection refused".into()));
        }
        let h = harness(october_replies(), failing);
        let err = h
            .orchestrator
            .sync(h.session.id, 1, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::PortalUnavailable(_)));
    }

    #[tokio::test]
    async fn cancellation_stops_at_a_family_boundary() {
        let h = harness(october_replies(), HashMap::new());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = h.orchestrator.sync(h.session.id, 2, &cancel).await.unwrap();
        assert!(report.cancelled);
        assert_eq!(report.periods_processed, 0);
        assert_eq!(h.documents.document_count().await, 0);
    }

    #[tokio::test]
    async fn forms_sync_keeps_internal_ids() {
        let mut replies = HashMap::new();
        for year in [2023, 2024] {
            replies.insert(
                key(&PortalRequest::FormList { form_code: "F29".into(), year }),
                json!({"forms": [{"folio": format!("{year}01"), "period": format!("{year}09"),
                                  "internal_id": format!("INT-{year}")}]}),
            );
        }
        let h = harness(replies.clone(), HashMap::new());
        let cancel = CancellationToken::new();
        let report = h.orchestrator.sync_forms(h.session.id, 2, &cancel).await.unwrap();
        assert_eq!(report.years, [2023, 2024]);
        assert_eq!(report.totals.new, 2);
        assert!(report.errors.is_empty());
        let forms = h.documents.forms(h.session.entity_id).await;
        assert!(forms.iter().all(|f| f.internal_id.is_some()));
    }

    #[tokio::test]
    async fn sync_many_runs_each_session() {
        let h = harness(october_replies(), HashMap::new());
        let cache = OrchestratorCache::new();
        let base = h.orchestrator.clone();
        let ghost = Session::new(
            h.session.entity_id,
            PortalCredentials {
                rut: "1-9".into(),
                password: "x".into(),
            },
        );
        let results = sync_many(
            &cache,
            |_| base.clone(),
            &[h.session.clone(), ghost.clone()],
            1,
            &CancellationToken::new(),
        )
        .await;
        assert_eq!(results.len(), 2);
        let ok = results.iter().find(|r| r.session_id == h.session.id).unwrap();
        assert!(ok.result.is_ok());
        let missing = results.iter().find(|r| r.session_id == ghost.id).unwrap();
        assert!(matches!(missing.result, Err(SyncError::SessionNotFound(_))));
        // The entity's cached orchestrator is dropped after a missing session.
        assert!(cache.is_empty());
    }

    struct PanickingClock;

    impl crate::periods::Clock for PanickingClock {
        fn today(&self) -> NaiveDate {
            panic!("clock unavailable")
        }
    }

    #[tokio::test]
    async fn sync_many_reports_a_panicked_session() {
        let h = harness(october_replies(), HashMap::new());
        let cache = OrchestratorCache::new();
        let broken = h.orchestrator.clone().with_clock(Arc::new(PanickingClock));
        let results = sync_many(
            &cache,
            |_| broken.clone(),
            std::slice::from_ref(&h.session),
            1,
            &CancellationToken::new(),
        )
        .await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].session_id, h.session.id);
        assert_eq!(results[0].entity_id, h.session.entity_id);
        match &results[0].result {
            Err(SyncError::TaskFailed(detail)) => assert!(detail.contains("panic"), "{detail}"),
            other => panic!("expected a task failure, got {other:?}"),
        }
        assert!(cache.is_empty());
    }
}
