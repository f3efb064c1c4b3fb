use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use index::{PipelineError, ProgressEvent, ProgressSender, RetryPolicy, emit};

use crate::retriever::RetrievalResult;
use crate::topics::Topic;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SummarizerConfig {
    pub base_url: String,
    pub model: String,
    pub temperature: f32,
    pub request_timeout_secs: u64,
}

impl Default for SummarizerConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            model: "llama3.1:8b".to_string(),
            temperature: 0.2,
            request_timeout_secs: 120,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySummary {
    pub entity_id: String,
    pub entity_name: String,
    pub topic: String,
    pub summary: String,
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Serialize)]
struct GenerateOptions {
    temperature: f32,
}

#[derive(Deserialize)]
struct GenerateResponse {
    response: String,
}

/// Writes short per-topic summaries of retrieved evidence with an Ollama model.
#[derive(Clone)]
pub struct ReviewSummarizer {
    base_url: String,
    model: String,
    temperature: f32,
    retry: RetryPolicy,
    client: reqwest::Client,
}

impl ReviewSummarizer {
    pub fn new(config: &SummarizerConfig, retry: RetryPolicy) -> Result<Self, PipelineError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| PipelineError::Configuration(format!("http client: {e}")))?;

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            temperature: config.temperature,
            retry,
            client,
        })
    }

    /// One non-streaming completion, retried as a whole. Newlines in the
    /// answer are flattened to spaces.
    pub async fn generate(&self, prompt: &str) -> Result<String, PipelineError> {
        let text = self
            .retry
            .retry("generate", || self.generate_once(prompt))
            .await?;
        Ok(text.trim().replace('\n', " "))
    }

    async fn generate_once(&self, prompt: &str) -> Result<String, PipelineError> {
        let url = format!("{}/api/generate", self.base_url);

        let request = GenerateRequest {
            model: &self.model,
            prompt,
            stream: false,
            options: GenerateOptions {
                temperature: self.temperature,
            },
        };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| PipelineError::Summarizer(format!("request to Ollama failed: {e}")))?;

        if !response.status().is_success() {
            return Err(PipelineError::Summarizer(format!(
                "Ollama request failed: {}",
                response.status()
            )));
        }

        let body: GenerateResponse = response
            .json()
            .await
            .map_err(|e| PipelineError::Summarizer(format!("failed to parse Ollama response: {e}")))?;

        Ok(body.response)
    }

    /// Summarize every entity in the result table for every topic, in entity
    /// id then topic order. Topics without excerpts get a fixed sentence
    /// instead of a model call.
    pub async fn summarize(
        &self,
        results: &[RetrievalResult],
        topics: &[Topic],
        progress: Option<&ProgressSender>,
    ) -> Result<Vec<EntitySummary>, PipelineError> {
        let mut by_entity: BTreeMap<&str, Vec<&RetrievalResult>> = BTreeMap::new();
        for result in results {
            by_entity.entry(&result.entity_id).or_default().push(result);
        }

        let total = by_entity.len();
        tracing::info!(entities = total, model = %self.model, "summarizing retrieved chunks");

        let mut summaries = Vec::with_capacity(total * topics.len());
        for (done, (entity_id, rows)) in by_entity.into_iter().enumerate() {
            let entity_name = rows[0].entity_name.as_str();

            for topic in topics {
                let excerpts: Vec<&RetrievalResult> = rows
                    .iter()
                    .copied()
                    .filter(|r| r.topic == topic.name)
                    .collect();

                let summary = if excerpts.is_empty() {
                    limited_details(&topic.name)
                } else {
                    let prompt = build_prompt(entity_name, &topic.name, &excerpts);
                    self.generate(&prompt).await?
                };

                summaries.push(EntitySummary {
                    entity_id: entity_id.to_string(),
                    entity_name: entity_name.to_string(),
                    topic: topic.name.clone(),
                    summary,
                });
            }

            emit(
                progress,
                ProgressEvent {
                    stage: "summarize",
                    entity_index: done + 1,
                    total,
                    message: format!("summary for {entity_name} complete"),
                },
            );
        }

        Ok(summaries)
    }
}

fn limited_details(topic: &str) -> String {
    format!("{topic} details are limited in the provided reviews.")
}

/// Prompt asking for a 2-3 sentence summary of one topic for one entity,
/// followed by the numbered excerpts with their star ratings.
pub fn build_prompt(entity_name: &str, topic: &str, excerpts: &[&RetrievalResult]) -> String {
    let mut prompt = format!(
        "You summarize customer reviews of the restaurant {entity_name}.\n\
         \n\
         Topic: {upper}\n\
         \n\
         Using only the excerpts below, write a 2-3 sentence summary of how \
         {entity_name} does on {topic}.\n\
         \n\
         Guidelines:\n\
         - Open by calling the reviews overall \"positive\", \"negative\" or \"mixed\".\n\
         - Cover recurring themes and points where reviewers disagree.\n\
         - Stay factual; add nothing the excerpts do not support.\n\
         \n\
         Avoid:\n\
         - Details that belong to another topic.\n\
         - Referring to excerpts by number.\n\
         - Introductory phrases such as \"Here is a summary\".\n\
         - Generic praise words unless an excerpt uses them.\n\
         \n\
         If the excerpts say little about the topic, answer only: \"{limited}\"\n\
         \n\
         Excerpts:\n",
        upper = topic.to_uppercase(),
        limited = limited_details(topic),
    );

    for (i, excerpt) in excerpts.iter().enumerate() {
        let _ = write!(
            prompt,
            "\n[{i}] Review ({} stars):\n{}\n",
            excerpt.star_rating, excerpt.text
        );
    }

    prompt
}
