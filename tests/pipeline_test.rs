use async_trait::async_trait;
use ledger_lens::embedding::Embedder;
use ledger_lens::execution::{Datastore, ResultSet, Row};
use ledger_lens::llm::{CompletionRequest, ConversationHistory, LanguageModel, Role};
use ledger_lens::query::{Embedding, QueryParam};
use ledger_lens::schema::DEFAULT_SCHEMA;
use ledger_lens::{
    AppConfig, AskRequest, BusinessId, Pipeline, PipelineError, ResolvedQuery, Result, Stage,
    GENERIC_FAILURE_MESSAGE,
};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Writes `sql_template` (with `{bid}` replaced by the business id from the prompt) for
/// query synthesis and `answer` for answer synthesis.
struct MockModel {
    sql_template: String,
    answer: String,
    delay: Option<Duration>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl MockModel {
    fn new(sql_template: &str, answer: &str) -> Arc<Self> {
        Arc::new(Self {
            sql_template: sql_template.to_string(),
            answer: answer.to_string(),
            delay: None,
            requests: Mutex::new(Vec::new()),
        })
    }

    fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            sql_template: String::new(),
            answer: String::new(),
            delay: Some(delay),
            requests: Mutex::new(Vec::new()),
        })
    }

    fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().unwrap().clone()
    }
}

fn business_id_in_prompt(system: &str) -> String {
    let marker = "business id '";
    let start = system.find(marker).map(|i| i + marker.len()).unwrap_or(0);
    let rest = &system[start..];
    rest[..rest.find('\'').unwrap_or(0)].to_string()
}

#[async_trait]
impl LanguageModel for MockModel {
    async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        self.requests.lock().unwrap().push(request.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if request.system.contains("Database schema") {
            let bid = business_id_in_prompt(&request.system);
            Ok(self.sql_template.replace("{bid}", &bid))
        } else {
            Ok(self.answer.clone())
        }
    }
}

struct MockEmbedder {
    calls: AtomicUsize,
    down: bool,
}

impl MockEmbedder {
    fn up() -> Arc<Self> {
        Arc::new(Self { calls: AtomicUsize::new(0), down: false })
    }

    fn down() -> Arc<Self> {
        Arc::new(Self { calls: AtomicUsize::new(0), down: true })
    }
}

#[async_trait]
impl Embedder for MockEmbedder {
    async fn embed(&self, text: &str) -> Result<Embedding> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.down {
            return Err(PipelineError::Embedding("embedding service unavailable".to_string()));
        }
        Ok(vec![text.len() as f32, 0.5, -0.25])
    }
}

struct MockStore {
    queries: Mutex<Vec<ResolvedQuery>>,
    failures: Mutex<Vec<PipelineError>>,
    rows: Vec<Row>,
}

impl MockStore {
    fn returning(rows: Vec<serde_json::Value>) -> Arc<Self> {
        Arc::new(Self {
            queries: Mutex::new(Vec::new()),
            failures: Mutex::new(Vec::new()),
            rows: rows.into_iter().map(|v| v.as_object().cloned().unwrap()).collect(),
        })
    }

    fn failing_first_with(error: PipelineError) -> Arc<Self> {
        let store = Self::returning(vec![json!({"sum": 1})]);
        store.failures.lock().unwrap().push(error);
        store
    }

    fn queries(&self) -> Vec<ResolvedQuery> {
        self.queries.lock().unwrap().clone()
    }
}

#[async_trait]
impl Datastore for MockStore {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn fetch(&self, query: &ResolvedQuery, max_rows: usize) -> Result<ResultSet> {
        self.queries.lock().unwrap().push(query.clone());
        if let Some(error) = self.failures.lock().unwrap().pop() {
            return Err(error);
        }
        Ok(ResultSet::from_rows(self.rows.clone(), max_rows))
    }
}

fn config(overrides: &[(&str, &str)]) -> AppConfig {
    let vars: HashMap<String, String> = overrides
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    AppConfig::from_lookup(|key| vars.get(key).cloned()).unwrap()
}

fn pipeline(model: Arc<MockModel>, embedder: Arc<MockEmbedder>, store: Arc<MockStore>) -> Pipeline {
    let store: Arc<dyn Datastore> = store;
    Pipeline::new(&config(&[]), model, embedder, Some(store), DEFAULT_SCHEMA.to_string())
}

fn ask(bid: &str, question: &str) -> AskRequest {
    AskRequest::new(BusinessId::parse(bid).unwrap(), question)
}

const ELECTRONICS_SQL: &str =
    "SELECT SUM(total) FROM transactions WHERE businessid = '{bid}' AND PLACEHOLDER(category, electronics)";

#[tokio::test]
async fn test_answers_category_question_end_to_end() {
    let model = MockModel::new(ELECTRONICS_SQL, "You spent $120.50 on electronics this month.");
    let embedder = MockEmbedder::up();
    let store = MockStore::returning(vec![json!({"sum": 120.5})]);
    let pipeline = pipeline(model.clone(), embedder.clone(), store.clone());

    let answer = pipeline
        .ask(&ask("1234", "What was my total spending this month on electronics"))
        .await
        .unwrap();
    assert_eq!(answer, "You spent $120.50 on electronics this month.");

    let queries = store.queries();
    assert_eq!(queries.len(), 1);
    assert_eq!(
        queries[0].sql,
        "SELECT SUM(total) FROM transactions WHERE businessid = '1234' AND categoryEmbedding <-> $1::vector < 0.5"
    );
    assert_eq!(queries[0].params.len(), 1);
    assert!(matches!(queries[0].params[0], QueryParam::Vector(_)));
    assert!(!queries[0].sql.contains("PLACEHOLDER"));
    assert_eq!(embedder.calls.load(Ordering::SeqCst), 1);

    let requests = model.requests();
    assert_eq!(requests.len(), 2);
    let answer_message = &requests[1].messages.last().unwrap().content;
    assert!(answer_message.contains("sum\n120.5"));
}

#[tokio::test]
async fn test_every_placeholder_becomes_a_predicate() {
    let sql = "SELECT vendor, SUM(total) FROM transactions WHERE businessid = '{bid}' \
               AND PLACEHOLDER(vendor, 'McDonald''s') AND PLACEHOLDER(item, coffee) \
               AND PLACEHOLDER(Category, \"food, drinks\") GROUP BY vendor";
    let model = MockModel::new(sql, "Mostly coffee.");
    let store = MockStore::returning(vec![json!({"vendor": "McDonalds", "sum": 9.5})]);
    let pipeline = pipeline(model, MockEmbedder::up(), store.clone());

    pipeline.ask(&ask("1234", "coffee at McDonald's?")).await.unwrap();

    let queries = store.queries();
    let query = &queries[0];
    assert_eq!(query.predicates.len(), 3);
    assert_eq!(query.params.len(), 3);
    assert!(query.sql.contains("vendorEmbedding <-> $1::vector < 0.5"));
    assert!(query.sql.contains("itemEmbedding <-> $2::vector < 0.5"));
    assert!(query.sql.contains("categoryEmbedding <-> $3::vector < 0.5"));
    assert!(query.sql.ends_with(" GROUP BY vendor"));
    assert!(!query.sql.to_uppercase().contains("PLACEHOLDER"));
}

#[tokio::test]
async fn test_query_without_placeholders_runs_unchanged() {
    let sql = "SELECT COUNT(*) FROM transactions WHERE businessid = '{bid}'";
    let model = MockModel::new(sql, "You have 3 transactions.");
    let embedder = MockEmbedder::up();
    let store = MockStore::returning(vec![json!({"count": 3})]);
    let pipeline = pipeline(model, embedder.clone(), store.clone());

    pipeline.ask(&ask("1234", "How many transactions?")).await.unwrap();

    let queries = store.queries();
    let query = &queries[0];
    assert_eq!(query.sql, "SELECT COUNT(*) FROM transactions WHERE businessid = '1234'");
    assert!(query.params.is_empty());
    assert_eq!(embedder.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_unknown_placeholder_kind_stops_before_embedding_and_execution() {
    let sql = "SELECT SUM(total) FROM transactions WHERE businessid = '{bid}' AND PLACEHOLDER(brand, sony)";
    let embedder = MockEmbedder::up();
    let store = MockStore::returning(Vec::new());
    let pipeline = pipeline(MockModel::new(sql, "unused"), embedder.clone(), store.clone());

    let failure = pipeline.ask(&ask("1234", "Sony spending?")).await.unwrap_err();
    assert_eq!(failure.stage, Stage::PlaceholderResolution);
    assert!(matches!(failure.error, PipelineError::PlaceholderParse(_)));
    assert_eq!(embedder.calls.load(Ordering::SeqCst), 0);
    assert!(store.queries().is_empty());
}

#[tokio::test]
async fn test_embedding_outage_returns_generic_message() {
    let model = MockModel::new(ELECTRONICS_SQL, "unused");
    let store = MockStore::returning(Vec::new());
    let pipeline = pipeline(model.clone(), MockEmbedder::down(), store.clone());
    let request = ask("1234", "Electronics spending?");

    let failure = pipeline.ask(&request).await.unwrap_err();
    assert_eq!(failure.stage, Stage::PlaceholderResolution);
    assert!(matches!(failure.error, PipelineError::Embedding(_)));

    assert_eq!(pipeline.respond(&request).await, GENERIC_FAILURE_MESSAGE);
    assert!(store.queries().is_empty());
    // Only the query synthesis calls were made, never the answer stage.
    assert!(model.requests().iter().all(|r| r.system.contains("Database schema")));
}

#[tokio::test]
async fn test_missing_tenant_filter_is_rejected_before_datastore() {
    let sql = "SELECT SUM(total) FROM transactions WHERE PLACEHOLDER(category, electronics)";
    let store = MockStore::returning(Vec::new());
    let pipeline = pipeline(MockModel::new(sql, "unused"), MockEmbedder::up(), store.clone());

    let failure = pipeline.ask(&ask("1234", "Electronics?")).await.unwrap_err();
    assert_eq!(failure.stage, Stage::Execution);
    assert!(matches!(failure.error, PipelineError::TenantIsolation(_)));
    assert!(store.queries().is_empty());
}

#[tokio::test]
async fn test_filter_for_another_business_is_rejected() {
    let sql = "SELECT SUM(total) FROM transactions WHERE businessid = '9999'";
    let store = MockStore::returning(Vec::new());
    let pipeline = pipeline(MockModel::new(sql, "unused"), MockEmbedder::up(), store.clone());

    let failure = pipeline.ask(&ask("1234", "Total?")).await.unwrap_err();
    assert!(matches!(failure.error, PipelineError::TenantIsolation(_)));
    assert!(store.queries().is_empty());
}

#[tokio::test]
async fn test_or_around_tenant_filter_is_rejected() {
    let sql = "SELECT * FROM transactions WHERE businessid = '{bid}' OR 1 = 1";
    let store = MockStore::returning(Vec::new());
    let pipeline = pipeline(MockModel::new(sql, "unused"), MockEmbedder::up(), store.clone());

    let failure = pipeline.ask(&ask("1234", "Everything")).await.unwrap_err();
    assert!(matches!(failure.error, PipelineError::TenantIsolation(_)));
    assert!(store.queries().is_empty());
}

#[tokio::test]
async fn test_transient_connection_failure_is_retried_once() {
    let sql = "SELECT SUM(total) FROM transactions WHERE businessid = '{bid}'";
    let store = MockStore::failing_first_with(PipelineError::Connection("connection reset".to_string()));
    let pipeline = pipeline(MockModel::new(sql, "One dollar."), MockEmbedder::up(), store.clone());

    let answer = pipeline.ask(&ask("1234", "Total?")).await.unwrap();
    assert_eq!(answer, "One dollar.");
    assert_eq!(store.queries().len(), 2);
}

#[tokio::test]
async fn test_query_error_is_not_retried() {
    let sql = "SELECT SUM(totl) FROM transactions WHERE businessid = '{bid}'";
    let store = MockStore::failing_first_with(PipelineError::Execution(
        "column \"totl\" does not exist (SQLSTATE 42703)".to_string(),
    ));
    let pipeline = pipeline(MockModel::new(sql, "unused"), MockEmbedder::up(), store.clone());

    let failure = pipeline.ask(&ask("1234", "Total?")).await.unwrap_err();
    assert_eq!(failure.stage, Stage::Execution);
    assert_eq!(store.queries().len(), 1);
}

#[tokio::test]
async fn test_blank_question_makes_no_external_calls() {
    let model = MockModel::new(ELECTRONICS_SQL, "unused");
    let pipeline = pipeline(model.clone(), MockEmbedder::up(), MockStore::returning(Vec::new()));

    let failure = pipeline.ask(&ask("1234", "   ")).await.unwrap_err();
    assert_eq!(failure.stage, Stage::Validation);
    assert!(model.requests().is_empty());
}

#[tokio::test]
async fn test_history_reaches_both_model_stages() {
    let sql = "SELECT SUM(total) FROM transactions WHERE businessid = '{bid}'";
    let model = MockModel::new(sql, "Same as before.");
    let pipeline = pipeline(model.clone(), MockEmbedder::up(), MockStore::returning(vec![json!({"sum": 2})]));

    let mut history = ConversationHistory::new(6);
    history.push_turn("How much did I spend last month?", "You spent $40.");
    pipeline
        .ask(&ask("1234", "And this month?").with_history(history))
        .await
        .unwrap();

    let requests = model.requests();
    assert_eq!(requests.len(), 2);
    for request in &requests {
        assert_eq!(request.messages.len(), 3);
        assert_eq!(request.messages[0].role, Role::User);
        assert_eq!(request.messages[0].content, "How much did I spend last month?");
        assert_eq!(request.messages[1].role, Role::Assistant);
    }
}

#[tokio::test]
async fn test_resolve_only_does_not_execute() {
    let store = MockStore::returning(Vec::new());
    let pipeline = pipeline(MockModel::new(ELECTRONICS_SQL, "unused"), MockEmbedder::up(), store.clone());

    let request = ask("1234", "Electronics?");
    let first = pipeline.resolve_only(&request).await.unwrap();
    let second = pipeline.resolve_only(&request).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(first.describe_params(), vec!["$1 = vector(3)"]);
    assert!(store.queries().is_empty());
}

#[tokio::test]
async fn test_without_datastore_ask_fails_at_execution() {
    let pipeline = Pipeline::new(
        &config(&[]),
        MockModel::new(ELECTRONICS_SQL, "unused"),
        MockEmbedder::up(),
        None,
        DEFAULT_SCHEMA.to_string(),
    );
    let failure = pipeline.ask(&ask("1234", "Electronics?")).await.unwrap_err();
    assert_eq!(failure.stage, Stage::Execution);
}

#[tokio::test]
async fn test_configured_threshold_is_used() {
    let pipeline = Pipeline::new(
        &config(&[("SIMILARITY_THRESHOLD", "0.3")]),
        MockModel::new(ELECTRONICS_SQL, "unused"),
        MockEmbedder::up(),
        None,
        DEFAULT_SCHEMA.to_string(),
    );
    let resolved = pipeline.resolve_only(&ask("1234", "Electronics?")).await.unwrap();
    assert!(resolved.sql.ends_with("categoryEmbedding <-> $1::vector < 0.3"));
}

#[tokio::test]
async fn test_synthesis_timeout_is_a_synthesis_failure() {
    let pipeline = Pipeline::new(
        &config(&[("LLM_TIMEOUT_SECS", "1")]),
        MockModel::slow(Duration::from_secs(5)),
        MockEmbedder::up(),
        Some(MockStore::returning(Vec::new()) as Arc<dyn Datastore>),
        DEFAULT_SCHEMA.to_string(),
    );
    let failure = pipeline.ask(&ask("1234", "Total?")).await.unwrap_err();
    assert_eq!(failure.stage, Stage::QuerySynthesis);
    assert!(matches!(failure.error, PipelineError::Synthesis(_)));
}

#[tokio::test]
async fn test_concurrent_requests_stay_in_their_tenant() {
    let sql = "SELECT SUM(total) FROM transactions WHERE businessid = '{bid}'";
    let store = MockStore::returning(vec![json!({"sum": 5})]);
    let pipeline = Arc::new(pipeline(MockModel::new(sql, "Five."), MockEmbedder::up(), store.clone()));

    let handles: Vec<_> = ["alpha", "beta", "gamma"]
        .into_iter()
        .map(|bid| {
            let pipeline = pipeline.clone();
            tokio::spawn(async move { pipeline.ask(&ask(bid, "Total?")).await })
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap(), "Five.");
    }

    let mut seen: Vec<String> = store.queries().into_iter().map(|q| q.sql).collect();
    seen.sort();
    assert_eq!(
        seen,
        vec![
            "SELECT SUM(total) FROM transactions WHERE businessid = 'alpha'",
            "SELECT SUM(total) FROM transactions WHERE businessid = 'beta'",
            "SELECT SUM(total) FROM transactions WHERE businessid = 'gamma'",
        ]
    );
}
