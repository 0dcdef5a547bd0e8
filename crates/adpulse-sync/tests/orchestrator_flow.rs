use std::sync::Arc;
use std::time::Duration;

use adpulse_adapters::testing::ScriptedTransport;
use adpulse_adapters::{AdsFetcherConfig, ApiTransport, CrmFetcherConfig, RuleSet};
use adpulse_core::{
    DateRange, DealStatus, Integration, IntegrationSettings, MetricBucket, SourceKind, SyncStatus,
    ALL_LABEL,
};
use adpulse_storage::{FetchError, MemoryStore};
use adpulse_sync::{CardEvent, Orchestrator, OrchestratorSettings, PlaintextVault, SyncError};
use async_trait::async_trait;
use chrono::NaiveDate;
use serde_json::{json, Value as JsonValue};
use uuid::Uuid;

const ADS_BASE: &str = "https://ads.test/v19.0";
const CRM_URL: &str = "https://crm.test/graphql";

fn settings() -> OrchestratorSettings {
    OrchestratorSettings {
        ads: AdsFetcherConfig {
            api_base: ADS_BASE.to_string(),
            ..AdsFetcherConfig::default()
        },
        crm: CrmFetcherConfig {
            api_url: CRM_URL.to_string(),
            ..CrmFetcherConfig::default()
        },
        ..OrchestratorSettings::default()
    }
}

fn orchestrator(
    store: Arc<MemoryStore>,
    transport: Arc<dyn ApiTransport>,
    settings: OrchestratorSettings,
) -> Orchestrator {
    Orchestrator::new(
        store,
        Arc::new(PlaintextVault),
        transport,
        Arc::new(RuleSet::builtin().unwrap()),
        settings,
    )
}

fn integration(company_id: Uuid, source: SourceKind) -> Integration {
    Integration {
        id: Uuid::new_v4(),
        company_id,
        source,
        credentials: Some("token".into()),
        account_id: (source == SourceKind::Ads).then(|| "1001".to_string()),
        pipeline_id: (source == SourceKind::Crm).then(|| "301".to_string()),
        active: true,
        settings: IntegrationSettings::default(),
        last_sync_at: None,
    }
}

fn day(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 1, d).unwrap()
}

fn january() -> Option<DateRange> {
    DateRange::new(day(1), day(2))
}

fn condominial_page() -> JsonValue {
    json!({
        "data": [
            {
                "campaign_id": "cmp-1",
                "campaign_name": "CONDOMINIAL Jan",
                "spend": "100.00",
                "impressions": "5000",
                "clicks": "80",
                "reach": "4000",
                "actions": [
                    { "action_type": "lead", "value": "2" },
                    { "action_type": "onsite_conversion.lead_grouped", "value": "2" }
                ],
                "date_start": "2026-01-01"
            },
            {
                "campaign_id": "cmp-1",
                "campaign_name": "CONDOMINIAL Jan",
                "spend": "50.00",
                "impressions": "2500",
                "clicks": "30",
                "reach": "2100",
                "actions": [{ "action_type": "lead", "value": "1" }],
                "date_start": "2026-01-02"
            }
        ],
        "paging": {}
    })
}

fn pipe_metadata() -> JsonValue {
    json!({ "data": { "pipe": {
        "id": "301",
        "phases": [{ "id": "1", "name": "Novo", "cards_count": 2 }],
        "labels": []
    } } })
}

fn card(id: &str, title: &str, phase: &str, labels: &[&str]) -> JsonValue {
    let labels: Vec<JsonValue> = labels.iter().map(|l| json!({ "name": l })).collect();
    json!({
        "id": id,
        "title": title,
        "createdAt": "2026-01-01T12:00:00Z",
        "updated_at": "2026-01-02T12:00:00Z",
        "finished_at": null,
        "current_phase": { "id": "1", "name": phase },
        "labels": labels,
        "assignees": [],
        "fields": [{ "name": "Valor do prêmio", "value": "1.234,56" }]
    })
}

fn cards_page(cards: Vec<JsonValue>) -> JsonValue {
    let edges: Vec<JsonValue> = cards.into_iter().map(|node| json!({ "node": node })).collect();
    json!({ "data": { "allCards": {
        "pageInfo": { "hasPreviousPage": false, "startCursor": null },
        "edges": edges
    } } })
}

fn bucket<'a>(buckets: &'a [MetricBucket], source: SourceKind, d: u32, label: &str) -> &'a MetricBucket {
    buckets
        .iter()
        .find(|b| b.source == source && b.date == day(d) && b.label == label)
        .unwrap_or_else(|| panic!("missing {source} bucket {d}/{label}"))
}

#[tokio::test]
async fn condominial_campaign_buckets_are_stable_across_runs() {
    let store = Arc::new(MemoryStore::new());
    let company = Uuid::new_v4();
    store.add_integration(integration(company, SourceKind::Ads)).await;
    let transport = Arc::new(
        ScriptedTransport::default()
            .with_route(ADS_BASE, vec![Ok(condominial_page()), Ok(condominial_page())]),
    );
    let orchestrator = orchestrator(store.clone(), transport.clone(), settings());

    let first = orchestrator.sync_company(company, january()).await.unwrap();
    assert_eq!(first.outcomes.len(), 1);
    assert_eq!(first.outcomes[0].status, SyncStatus::Success);
    let after_first = store.buckets().await;

    for label in ["condominial", ALL_LABEL] {
        let jan1 = bucket(&after_first, SourceKind::Ads, 1, label);
        assert_eq!((jan1.spend, jan1.leads), (100.0, 2));
        let jan2 = bucket(&after_first, SourceKind::Ads, 2, label);
        assert_eq!((jan2.spend, jan2.leads), (50.0, 1));
    }
    assert_eq!(after_first.len(), 4);
    assert_eq!(store.campaign_days().await.len(), 2);

    let second = orchestrator.sync_company(company, january()).await.unwrap();
    assert_eq!(second.outcomes[0].status, SyncStatus::Success);
    assert_eq!(store.buckets().await, after_first);
    assert_eq!(store.campaign_days().await.len(), 2);
    assert_eq!(store.outcomes().await.len(), 2);

    let url = &transport.requests()[0].url;
    assert!(url.contains("act_1001"));
    assert!(url.contains("2026-01-02"));
}

#[tokio::test]
async fn failing_source_does_not_block_its_sibling() {
    let store = Arc::new(MemoryStore::new());
    let company = Uuid::new_v4();
    let ads = integration(company, SourceKind::Ads);
    let crm = integration(company, SourceKind::Crm);
    store.add_integration(ads.clone()).await;
    store.add_integration(crm.clone()).await;

    let transport = Arc::new(
        ScriptedTransport::default()
            .with_route(
                ADS_BASE,
                vec![Err(FetchError::Unauthorized {
                    status: 401,
                    url: ADS_BASE.to_string(),
                })],
            )
            .with_route(
                CRM_URL,
                vec![
                    Ok(pipe_metadata()),
                    Ok(cards_page(vec![
                        card("11", "Seguro Auto Pedro", "Ganho", &["META ADS"]),
                        card("12", "Cliente Lia", "Novo", &[]),
                    ])),
                ],
            ),
    );
    let orchestrator = orchestrator(store.clone(), transport, settings());
    let report = orchestrator.sync_company(company, january()).await.unwrap();

    assert_eq!(report.outcomes.len(), 2);
    assert!(report.has_errors());
    let ads_outcome = report.outcomes.iter().find(|o| o.source == SourceKind::Ads).unwrap();
    let crm_outcome = report.outcomes.iter().find(|o| o.source == SourceKind::Crm).unwrap();
    assert_eq!(ads_outcome.status, SyncStatus::Error);
    assert!(ads_outcome.message.contains("credentials rejected"));
    assert_eq!(crm_outcome.status, SyncStatus::Success);
    assert_eq!(crm_outcome.record_count, 2);

    let buckets = store.buckets().await;
    let created = bucket(&buckets, SourceKind::Crm, 1, ALL_LABEL);
    assert_eq!(created.created, 2);
    let won = bucket(&buckets, SourceKind::Crm, 2, "auto");
    assert_eq!(won.converted, 1);
    assert!((won.won_amount - 1234.56).abs() < 1e-9);
    assert!(buckets.iter().all(|b| b.source == SourceKind::Crm));

    assert!(store.integration(ads.id).await.unwrap().last_sync_at.is_none());
    assert!(store.integration(crm.id).await.unwrap().last_sync_at.is_some());
    assert_eq!(store.outcomes().await.len(), 2);
}

#[tokio::test]
async fn unknown_company_is_a_caller_error() {
    let store = Arc::new(MemoryStore::new());
    let orchestrator = orchestrator(store.clone(), Arc::new(ScriptedTransport::new(vec![])), settings());
    let err = orchestrator.sync_company(Uuid::new_v4(), None).await.unwrap_err();
    assert!(matches!(err, SyncError::CompanyNotFound(_)));
    assert!(store.outcomes().await.is_empty());
}

#[tokio::test]
async fn missing_credentials_fail_only_that_source() {
    let store = Arc::new(MemoryStore::new());
    let company = Uuid::new_v4();
    let mut ads = integration(company, SourceKind::Ads);
    ads.credentials = None;
    store.add_integration(ads).await;
    let transport = Arc::new(ScriptedTransport::new(vec![]));
    let orchestrator = orchestrator(store.clone(), transport.clone(), settings());

    let report = orchestrator.sync_company(company, january()).await.unwrap();
    assert_eq!(report.outcomes[0].status, SyncStatus::Error);
    assert!(report.outcomes[0].message.contains("no stored credentials"));
    assert!(transport.requests().is_empty());
}

#[tokio::test]
async fn failed_batch_aborts_the_rest_of_the_source() {
    let store = Arc::new(MemoryStore::new());
    let company = Uuid::new_v4();
    store.add_integration(integration(company, SourceKind::Ads)).await;
    store.fail_upserts_after(1).await;
    let transport = Arc::new(ScriptedTransport::default().with_route(ADS_BASE, vec![Ok(condominial_page())]));
    let orchestrator = orchestrator(
        store.clone(),
        transport,
        OrchestratorSettings {
            write_batch_size: 1,
            ..settings()
        },
    );

    let report = orchestrator.sync_company(company, january()).await.unwrap();
    let outcome = &report.outcomes[0];
    assert_eq!(outcome.status, SyncStatus::Error);
    assert!(outcome.message.contains("storage write failed"));
    assert_eq!(store.campaign_days().await.len(), 1);
    assert!(store.buckets().await.is_empty());
}

struct StalledTransport;

#[async_trait]
impl ApiTransport for StalledTransport {
    async fn get_json(&self, _url: &str) -> Result<JsonValue, FetchError> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(json!({ "data": [] }))
    }

    async fn post_json(
        &self,
        _url: &str,
        _bearer: &str,
        _body: &JsonValue,
    ) -> Result<JsonValue, FetchError> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(json!({ "data": null }))
    }
}

#[tokio::test(start_paused = true)]
async fn stalled_source_times_out_into_an_error_outcome() {
    let store = Arc::new(MemoryStore::new());
    let company = Uuid::new_v4();
    store.add_integration(integration(company, SourceKind::Crm)).await;
    let orchestrator = orchestrator(
        store.clone(),
        Arc::new(StalledTransport),
        OrchestratorSettings {
            source_timeout: Duration::from_secs(30),
            ..settings()
        },
    );

    let report = orchestrator.sync_company(company, None).await.unwrap();
    assert_eq!(report.outcomes.len(), 1);
    assert_eq!(report.outcomes[0].status, SyncStatus::Error);
    assert!(report.outcomes[0].message.contains("timed out"));
}

#[tokio::test]
async fn categories_that_disappear_are_retired() {
    let store = Arc::new(MemoryStore::new());
    let company = Uuid::new_v4();
    store.add_integration(integration(company, SourceKind::Crm)).await;
    let transport = Arc::new(ScriptedTransport::default().with_route(
        CRM_URL,
        vec![
            Ok(pipe_metadata()),
            Ok(cards_page(vec![card("21", "Seguro de Vida Ana", "Novo", &[])])),
            Ok(pipe_metadata()),
            Ok(cards_page(vec![card("21", "Cliente Ana", "Novo", &[])])),
        ],
    ));
    let orchestrator = orchestrator(store.clone(), transport, settings());

    orchestrator.sync_company(company, None).await.unwrap();
    assert!(store.buckets().await.iter().any(|b| b.label == "vida"));

    let report = orchestrator.sync_company(company, None).await.unwrap();
    assert!(report.outcomes[0].message.contains("retired"));
    let labels: Vec<String> = store.buckets().await.into_iter().map(|b| b.label).collect();
    assert_eq!(labels, vec![ALL_LABEL.to_string()]);
    assert_eq!(store.deals().await.len(), 1);
}

#[tokio::test]
async fn sync_all_visits_every_active_company() {
    let store = Arc::new(MemoryStore::new());
    let a = Uuid::new_v4();
    let b = Uuid::new_v4();
    store.add_integration(integration(a, SourceKind::Ads)).await;
    let mut inactive = integration(b, SourceKind::Ads);
    inactive.active = false;
    store.add_integration(inactive).await;
    let transport = Arc::new(ScriptedTransport::default().with_route(ADS_BASE, vec![Ok(condominial_page())]));
    let orchestrator = orchestrator(store.clone(), transport, settings());

    let reports = orchestrator.sync_all_active_companies().await.unwrap();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].company_id, a);
    assert!(!reports[0].has_errors());
}

fn webhook_event(action: &str, id: u64, pipe: &str, phase: &str) -> CardEvent {
    CardEvent::from_json(json!({
        "action": action,
        "data": { "card": {
            "id": id,
            "title": "Seguro Condomínio Bela Vista",
            "created_at": "2026-01-01T09:00:00Z",
            "updated_at": "2026-01-02T09:00:00Z",
            "current_phase": { "id": 7, "name": phase },
            "labels": [{ "name": "FACEBOOK" }],
            "fields": [{ "name": "Valor", "value": "2.000,00" }],
            "pipe": { "id": pipe }
        } }
    }))
    .unwrap()
}

#[tokio::test]
async fn webhook_updates_one_card_and_recomputes_buckets() {
    let store = Arc::new(MemoryStore::new());
    let company = Uuid::new_v4();
    let crm = integration(company, SourceKind::Crm);
    store.add_integration(crm.clone()).await;
    let orchestrator = orchestrator(store.clone(), Arc::new(ScriptedTransport::new(vec![])), settings());

    let outcome = orchestrator
        .handle_card_event(webhook_event("card.move", 501, "301", "Ganho"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(outcome.status, SyncStatus::Success);
    let deals = store.deals().await;
    assert_eq!(deals.len(), 1);
    assert_eq!(deals[0].deal.status, DealStatus::Won);
    assert_eq!(deals[0].deal.amount, Some(2000.0));
    let buckets = store.buckets().await;
    assert_eq!(bucket(&buckets, SourceKind::Crm, 2, "condominial").converted, 1);
    assert!(store.integration(crm.id).await.unwrap().last_sync_at.is_none());

    orchestrator
        .handle_card_event(webhook_event("card.delete", 501, "301", "Ganho"))
        .await
        .unwrap();
    assert!(store.deals().await.is_empty());
    assert!(store.buckets().await.is_empty());
    assert_eq!(store.outcomes().await.len(), 2);
}

#[tokio::test]
async fn webhook_for_unknown_or_inactive_pipelines() {
    let store = Arc::new(MemoryStore::new());
    let company = Uuid::new_v4();
    let mut crm = integration(company, SourceKind::Crm);
    crm.active = false;
    store.add_integration(crm).await;
    let orchestrator = orchestrator(store.clone(), Arc::new(ScriptedTransport::new(vec![])), settings());

    let err = orchestrator
        .handle_card_event(webhook_event("card.create", 1, "999", "Novo"))
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::UnknownPipeline(id) if id == "999"));

    let ignored = orchestrator
        .handle_card_event(webhook_event("card.create", 1, "301", "Novo"))
        .await
        .unwrap();
    assert!(ignored.is_none());
    assert!(store.deals().await.is_empty());
    assert!(store.outcomes().await.is_empty());
}

fn capped_cards_page(cards: Vec<JsonValue>) -> JsonValue {
    let mut page = cards_page(cards);
    page["data"]["allCards"]["pageInfo"] = json!({ "hasPreviousPage": true, "startCursor": "cursor-older" });
    page
}

fn capped(mut settings: OrchestratorSettings) -> OrchestratorSettings {
    settings.ads.max_pages = 1;
    settings.crm.max_pages = 1;
    settings
}

#[tokio::test]
async fn cards_removed_upstream_stop_counting_on_every_path() {
    let store = Arc::new(MemoryStore::new());
    let company = Uuid::new_v4();
    store.add_integration(integration(company, SourceKind::Crm)).await;
    let transport = Arc::new(ScriptedTransport::default().with_route(
        CRM_URL,
        vec![
            Ok(pipe_metadata()),
            Ok(cards_page(vec![
                card("31", "Cliente Ana", "Novo", &[]),
                card("32", "Cliente Bruno", "Novo", &[]),
            ])),
            Ok(pipe_metadata()),
            Ok(cards_page(vec![card("31", "Cliente Ana", "Novo", &[])])),
        ],
    ));
    let orchestrator = orchestrator(store.clone(), transport, settings());

    orchestrator.sync_company(company, None).await.unwrap();
    assert_eq!(bucket(&store.buckets().await, SourceKind::Crm, 1, ALL_LABEL).created, 2);

    let report = orchestrator.sync_company(company, None).await.unwrap();
    assert_eq!(report.outcomes[0].status, SyncStatus::Success);
    assert!(report.outcomes[0].message.contains("removed 1 deleted cards"));
    let after_full = store.buckets().await;
    assert_eq!(bucket(&after_full, SourceKind::Crm, 1, ALL_LABEL).created, 1);
    let ids: Vec<String> = store.deals().await.into_iter().map(|d| d.deal.card_id).collect();
    assert_eq!(ids, vec!["31".to_string()]);

    orchestrator
        .handle_card_event(webhook_event("card.move", 31, "301", "Novo"))
        .await
        .unwrap();
    let after_event = store.buckets().await;
    assert_eq!(bucket(&after_event, SourceKind::Crm, 1, ALL_LABEL).created, 1);
}

#[tokio::test]
async fn capped_crm_fetch_keeps_older_cards_and_buckets() {
    let store = Arc::new(MemoryStore::new());
    let company = Uuid::new_v4();
    store.add_integration(integration(company, SourceKind::Crm)).await;
    let full = Arc::new(ScriptedTransport::default().with_route(
        CRM_URL,
        vec![
            Ok(pipe_metadata()),
            Ok(cards_page(vec![
                card("21", "Seguro de Vida Ana", "Novo", &[]),
                card("22", "Cliente Bruno", "Novo", &[]),
            ])),
        ],
    ));
    orchestrator(store.clone(), full, settings())
        .sync_company(company, None)
        .await
        .unwrap();
    let seeded_vida = bucket(&store.buckets().await, SourceKind::Crm, 1, "vida").clone();

    let partial = Arc::new(ScriptedTransport::default().with_route(
        CRM_URL,
        vec![
            Ok(pipe_metadata()),
            Ok(capped_cards_page(vec![card("21", "Cliente Ana", "Novo", &[])])),
        ],
    ));
    let report = orchestrator(store.clone(), partial.clone(), capped(settings()))
        .sync_company(company, None)
        .await
        .unwrap();

    let outcome = &report.outcomes[0];
    assert_eq!(outcome.status, SyncStatus::Success);
    assert!(outcome.message.contains("truncated"));
    assert_eq!(partial.requests().len(), 2);

    let buckets = store.buckets().await;
    assert_eq!(bucket(&buckets, SourceKind::Crm, 1, ALL_LABEL).created, 2);
    assert_eq!(bucket(&buckets, SourceKind::Crm, 1, "vida"), &seeded_vida);
    assert_eq!(store.deals().await.len(), 2);
}

#[tokio::test]
async fn capped_ads_fetch_does_not_retire_unfetched_days() {
    let store = Arc::new(MemoryStore::new());
    let company = Uuid::new_v4();
    store.add_integration(integration(company, SourceKind::Ads)).await;
    let full = Arc::new(ScriptedTransport::default().with_route(ADS_BASE, vec![Ok(condominial_page())]));
    orchestrator(store.clone(), full, settings())
        .sync_company(company, january())
        .await
        .unwrap();
    assert_eq!(store.buckets().await.len(), 4);

    let mut first_page = condominial_page();
    first_page["data"].as_array_mut().unwrap().truncate(1);
    first_page["paging"] = json!({ "next": format!("{ADS_BASE}/act_1001/insights?after=p2") });
    let partial = Arc::new(ScriptedTransport::default().with_route(ADS_BASE, vec![Ok(first_page)]));
    let report = orchestrator(store.clone(), partial, capped(settings()))
        .sync_company(company, january())
        .await
        .unwrap();

    let outcome = &report.outcomes[0];
    assert_eq!(outcome.status, SyncStatus::Success);
    assert!(outcome.message.contains("page cap reached"));
    let buckets = store.buckets().await;
    assert_eq!(buckets.len(), 4);
    assert_eq!(bucket(&buckets, SourceKind::Ads, 2, ALL_LABEL).spend, 50.0);
}

#[tokio::test]
async fn concurrent_card_events_settle_on_consistent_buckets() {
    let store = Arc::new(MemoryStore::new());
    let company = Uuid::new_v4();
    store.add_integration(integration(company, SourceKind::Crm)).await;
    let orchestrator = orchestrator(store.clone(), Arc::new(ScriptedTransport::new(vec![])), settings());

    let (a, b) = tokio::join!(
        orchestrator.handle_card_event(webhook_event("card.create", 601, "301", "Novo")),
        orchestrator.handle_card_event(webhook_event("card.create", 602, "301", "Novo")),
    );
    assert_eq!(a.unwrap().unwrap().status, SyncStatus::Success);
    assert_eq!(b.unwrap().unwrap().status, SyncStatus::Success);

    let buckets = store.buckets().await;
    assert_eq!(store.deals().await.len(), 2);
    assert_eq!(bucket(&buckets, SourceKind::Crm, 1, ALL_LABEL).created, 2);
    assert_eq!(bucket(&buckets, SourceKind::Crm, 1, "condominial").created, 2);
}
