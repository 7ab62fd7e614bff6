//! Prompt templates for the two language-model stages.

use crate::placeholder::{PlaceholderKind, PLACEHOLDER_MARKER};
use crate::query::BusinessId;
use chrono::{DateTime, Local};

/// System instructions for turning a question into SQL.
pub fn query_synthesis_prompt(
    business_id: &BusinessId,
    tenant_column: &str,
    schema_description: &str,
    now: DateTime<Local>,
) -> String {
    let kinds: Vec<&str> = PlaceholderKind::ALL.iter().map(|k| k.as_str()).collect();

    format!(
        r#"You translate questions about a business's financial transactions into a single PostgreSQL SELECT query.

Current date and time: {now} ({weekday}). Resolve relative dates such as "this month" or "last week" against it.

Database schema:
{schema}

Rules:
1. Every query may only read data for business id '{business_id}'. Every WHERE clause that reads a table must contain `{tenant_column} = '{business_id}'` combined with AND. Never combine it with OR.
2. Never compare text or embedding columns semantically yourself. Do not use LIKE/ILIKE on category, vendor or item names and never use the <-> operator. When the question refers to a category, vendor or item by meaning, write {marker}(kind, search text) instead, where kind is one of: {kinds}.
   Example: {marker}(category, electronics)
3. Return a single read-only SELECT (or WITH ... SELECT) statement. No INSERT, UPDATE, DELETE or DDL.
4. Do not use bind parameters such as $1.
5. Reply with the SQL only, no explanation and no Markdown.

Example:
Question: What was my total spending this month on electronics
SQL: SELECT SUM(total) FROM transactions WHERE {tenant_column} = '{business_id}' AND date >= date_trunc('month', CURRENT_DATE) AND {marker}(category, electronics)"#,
        now = now.format("%Y-%m-%d %H:%M:%S %:z"),
        weekday = now.format("%A"),
        schema = schema_description.trim(),
        business_id = business_id,
        tenant_column = tenant_column,
        marker = PLACEHOLDER_MARKER,
        kinds = kinds.join(", "),
    )
}

/// System instructions for answering from query results.
pub fn answer_prompt() -> &'static str {
    r#"You answer a business owner's question about their financial transactions.
Use only the query results provided in the user message; do not invent numbers or records.
Mention only the information that is relevant to the question, even if the results contain more.
If the results are empty or do not answer the question, say so plainly.
If the results were truncated, say that the answer is based on partial data.
Answer concisely in plain language."#
}

/// User message carrying the question and the serialized results.
pub fn answer_user_message(question: &str, results: &str) -> String {
    format!("Question: {}\n\nQuery results:\n{}", question.trim(), results)
}
