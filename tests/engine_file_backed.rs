use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use recur::combined::CombinedTaskStore;
use recur::config::EngineConfig;
use recur::date::CalendarDate;
use recur::occurrence::{FieldValue, TaskField};
use recur::reconcile::Reconciler;
use recur::repository::{JsonTemplateRepository, TemplateRepository};
use recur::storage::Storage;
use recur::store::{FileOccurrenceStore, OccurrenceStore};
use recur::template::{Template, TemplatePatch};

const TIMEOUT_MS: u64 = 2_000;

struct Engine {
    store: CombinedTaskStore,
    occurrences: Arc<FileOccurrenceStore>,
}

async fn open(storage: &Storage) -> Engine {
    let repository = Arc::new(JsonTemplateRepository::new(storage.templates_file(), TIMEOUT_MS));
    let occurrences = Arc::new(
        FileOccurrenceStore::open(storage.occurrences_file(), TIMEOUT_MS)
            .await
            .expect("open occurrences"),
    );
    let reconciler = Arc::new(Reconciler::new(
        Arc::clone(&occurrences) as Arc<dyn OccurrenceStore>,
        EngineConfig::default(),
    ));
    let store = CombinedTaskStore::create(repository, reconciler).expect("create store");
    Engine { store, occurrences }
}

fn rent() -> Template {
    let mut template = Template::new("", "Pay rent");
    template.recurring = true;
    template.interval = Some(2);
    template.deadline = Some("2024-01-15".to_string());
    template.final_date = Some("2024-07-15".to_string());
    template
}

#[tokio::test]
async fn edits_persist_across_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");
    let storage = Storage::in_dir(dir.path());
    storage.init().expect("init");

    let engine = open(&storage).await;
    engine.store.refresh().await.expect("refresh");
    let template = engine.store.add_template(rent()).await.expect("add");
    let march = format!("{}#2024-03-15", template.id);
    engine
        .store
        .update_field(&march, TaskField::Completed, FieldValue::Flag(true))
        .await
        .expect("complete");
    engine
        .store
        .update_field(&template.id, TaskField::Title, FieldValue::Text("Rent".to_string()))
        .await
        .expect("rename");
    engine.store.dispose().await;

    let reopened = open(&storage).await;
    let report = reopened.store.refresh().await.expect("refresh");
    assert!(!report.has_writes());
    assert_eq!(report.instance_count, 4);

    let view = reopened.store.get_all();
    assert_eq!(view.len(), 4);
    assert!(view.iter().all(|task| task.title == "Rent"));
    let completed: Vec<&str> = view
        .iter()
        .filter(|task| task.completed)
        .map(|task| task.id.as_str())
        .collect();
    assert_eq!(completed, vec![march.as_str()]);
    assert_eq!(
        reopened
            .occurrences
            .get(&march)
            .await
            .expect("get")
            .expect("stored")
            .occurrence_date,
        CalendarDate::from_ymd(2024, 3, 15)
    );
    reopened.store.dispose().await;
}

#[tokio::test]
async fn second_handle_sees_writes_after_reload() {
    let dir = tempfile::tempdir().expect("tempdir");
    let storage = Storage::in_dir(dir.path());
    storage.init().expect("init");

    let watcher = FileOccurrenceStore::open(storage.occurrences_file(), TIMEOUT_MS)
        .await
        .expect("open");
    let engine = open(&storage).await;
    let template = engine.store.add_template(rent()).await.expect("add");
    engine.store.dispose().await;

    assert!(watcher.get_all().await.expect("all").is_empty());
    watcher.reload().await.expect("reload");
    let ids: Vec<String> = watcher
        .get_by_template(&template.id)
        .await
        .expect("by template")
        .into_iter()
        .map(|occurrence| occurrence.id)
        .collect();
    assert_eq!(ids.len(), 4);
    assert!(ids[0].ends_with("#2024-01-15"));
}

#[tokio::test]
async fn external_template_removal_cleans_up() {
    let dir = tempfile::tempdir().expect("tempdir");
    let storage = Storage::in_dir(dir.path());
    storage.init().expect("init");

    let engine = open(&storage).await;
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let _subscription = engine.store.subscribe(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    let template = engine.store.add_template(rent()).await.expect("add");

    let repository = JsonTemplateRepository::new(storage.templates_file(), TIMEOUT_MS);
    repository.delete(&template.id).await.expect("delete");

    let report = engine.store.refresh().await.expect("refresh");
    assert_eq!(report.removed, vec![template.id.clone()]);
    assert_eq!(report.deleted.len(), 4);
    assert!(engine.store.get_all().is_empty());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    engine.store.dispose().await;
}

#[tokio::test]
async fn long_running_refresh_keeps_edits_from_another_process() {
    let dir = tempfile::tempdir().expect("tempdir");
    let storage = Storage::in_dir(dir.path());
    storage.init().expect("init");

    let watcher = open(&storage).await;
    let template = watcher.store.add_template(rent()).await.expect("add");
    watcher.store.refresh().await.expect("first pass");
    let march = format!("{}#2024-03-15", template.id);

    // A short-lived `recur set` sharing the data directory.
    let editor = open(&storage).await;
    editor.store.refresh().await.expect("editor refresh");
    editor
        .store
        .update_field(&march, TaskField::Completed, FieldValue::Flag(true))
        .await
        .expect("complete");
    editor.store.dispose().await;

    let repository = JsonTemplateRepository::new(storage.templates_file(), TIMEOUT_MS);
    let rename = TemplatePatch {
        title: Some("Rent".to_string()),
        ..TemplatePatch::default()
    };
    repository.update(&template.id, &rename).await.expect("rename");

    let report = watcher.store.refresh().await.expect("second pass");
    assert_eq!(report.cascaded, vec![template.id.clone()]);
    let view = watcher.store.get_all();
    assert!(view.iter().all(|task| task.title == "Rent"));
    let completed: Vec<&str> = view
        .iter()
        .filter(|task| task.completed)
        .map(|task| task.id.as_str())
        .collect();
    assert_eq!(completed, vec![march.as_str()]);
    watcher.store.dispose().await;

    let on_disk = FileOccurrenceStore::open(storage.occurrences_file(), TIMEOUT_MS)
        .await
        .expect("reopen");
    let stored = on_disk.get(&march).await.expect("get").expect("stored");
    assert_eq!(stored.base_fields.title, "Rent");
    assert_eq!(stored.overrides.completed, Some(true));
    assert!(stored.completion_status);
}
