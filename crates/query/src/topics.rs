use serde::{Deserialize, Serialize};

use index::{Embedder, IndexManifest, Metric, PipelineError, RetryPolicy, embed_all};

/// A named semantic query concept, described by a keyword string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topic {
    pub name: String,
    pub keywords: String,
}

impl Topic {
    pub fn new(name: &str, keywords: &str) -> Self {
        Self {
            name: name.to_string(),
            keywords: keywords.to_string(),
        }
    }
}

pub fn default_topics() -> Vec<Topic> {
    vec![
        Topic::new(
            "food",
            "food taste flavor menu dishes portion fresh spicy presentation",
        ),
        Topic::new(
            "service",
            "service staff wait time hostess server rude friendly attentive",
        ),
        Topic::new(
            "ambiance",
            "ambiance atmosphere decor music lighting seating noise vibe",
        ),
    ]
}

#[derive(Debug, Clone, PartialEq)]
pub struct TopicQuery {
    pub topic_name: String,
    pub keyword_text: String,
    pub query_vector: Vec<f32>,
}

/// Embeds topic descriptions with the settings the indexes were built with.
pub struct TopicEncoder<'a, E> {
    embedder: &'a E,
    metric: Metric,
    normalize: bool,
    retry: &'a RetryPolicy,
}

impl<'a, E: Embedder> TopicEncoder<'a, E> {
    pub fn new(embedder: &'a E, metric: Metric, normalize: bool, retry: &'a RetryPolicy) -> Self {
        Self {
            embedder,
            metric,
            normalize,
            retry,
        }
    }

    pub fn unit_normalize(&self) -> bool {
        self.normalize || self.metric == Metric::Cosine
    }

    /// The manifest an index directory must carry to be searchable with these vectors.
    pub fn expected_manifest(&self) -> IndexManifest {
        IndexManifest {
            model: self.embedder.model().to_string(),
            dimension: self.embedder.dimension(),
            metric: self.metric,
            normalized: self.unit_normalize(),
        }
    }

    /// Embed all topics in a single provider call, keeping configuration order.
    pub async fn encode(&self, topics: &[Topic]) -> Result<Vec<TopicQuery>, PipelineError> {
        if topics.is_empty() {
            return Err(PipelineError::Configuration(
                "at least one topic is required".to_string(),
            ));
        }
        if let Some(name) = duplicate_name(topics) {
            return Err(PipelineError::Configuration(format!(
                "topic {name} is defined twice"
            )));
        }

        let texts: Vec<String> = topics.iter().map(|t| t.keywords.clone()).collect();
        let vectors = embed_all(
            self.embedder,
            &texts,
            texts.len(),
            self.retry,
            self.unit_normalize(),
        )
        .await?;

        tracing::info!(topics = topics.len(), model = self.embedder.model(), "encoded topics");

        Ok(topics
            .iter()
            .zip(vectors)
            .map(|(topic, query_vector)| TopicQuery {
                topic_name: topic.name.clone(),
                keyword_text: topic.keywords.clone(),
                query_vector,
            })
            .collect())
    }
}

fn duplicate_name(topics: &[Topic]) -> Option<&str> {
    topics
        .iter()
        .enumerate()
        .find(|(i, t)| topics[..*i].iter().any(|earlier| earlier.name == t.name))
        .map(|(_, t)| t.name.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use index::testing::{FailingEmbedder, KeywordEmbedder};

    #[tokio::test]
    async fn test_encodes_in_configuration_order_with_one_call() {
        let embedder = KeywordEmbedder::new(&["food", "service", "music"]);
        let retry = RetryPolicy::none();
        let encoder = TopicEncoder::new(&embedder, Metric::Cosine, false, &retry);
        let topics = vec![
            Topic::new("service", "service service"),
            Topic::new("food", "food"),
        ];

        let queries = encoder.encode(&topics).await.unwrap();

        assert_eq!(embedder.calls(), 1);
        assert_eq!(queries[0].topic_name, "service");
        assert_eq!(queries[0].query_vector, vec![0.0, 1.0, 0.0]);
        assert_eq!(queries[1].topic_name, "food");
        assert_eq!(queries[1].keyword_text, "food");
    }

    #[tokio::test]
    async fn test_l2_without_normalize_keeps_raw_vectors() {
        let embedder = KeywordEmbedder::new(&["food"]);
        let retry = RetryPolicy::none();
        let encoder = TopicEncoder::new(&embedder, Metric::L2, false, &retry);

        let queries = encoder
            .encode(&[Topic::new("food", "food food food")])
            .await
            .unwrap();

        assert_eq!(queries[0].query_vector, vec![3.0]);
        assert!(!encoder.expected_manifest().normalized);
    }

    #[tokio::test]
    async fn test_rejects_empty_and_duplicate_topics() {
        let embedder = KeywordEmbedder::new(&["food"]);
        let retry = RetryPolicy::none();
        let encoder = TopicEncoder::new(&embedder, Metric::Cosine, true, &retry);

        assert!(matches!(
            encoder.encode(&[]).await,
            Err(PipelineError::Configuration(_))
        ));
        let twice = vec![Topic::new("food", "food"), Topic::new("food", "taste")];
        assert!(matches!(
            encoder.encode(&twice).await,
            Err(PipelineError::Configuration(_))
        ));
        assert_eq!(embedder.calls(), 0);
    }

    #[tokio::test]
    async fn test_provider_failure_propagates() {
        let embedder = FailingEmbedder { dimension: 3 };
        let retry = RetryPolicy::none();
        let encoder = TopicEncoder::new(&embedder, Metric::Cosine, true, &retry);

        let err = encoder.encode(&default_topics()).await.unwrap_err();

        assert!(matches!(err, PipelineError::EmbeddingProvider(_)));
    }

    #[test]
    fn test_default_topics() {
        let names: Vec<_> = default_topics().into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["food", "service", "ambiance"]);
    }
}
