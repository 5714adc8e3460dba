//! 记忆子系统端到端测试

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use recall::embedding::HashEmbedder;
use recall::{
    Embedder, MemoryConfig, MemoryCoordinator, RawDoc, Resolution,
};

fn keywords(words: &[&str]) -> HashSet<String> {
    words.iter().map(|s| s.to_string()).collect()
}

/// 在每次嵌入前注入固定延迟的包装器，用于并发观测
struct SlowEmbedder {
    inner: HashEmbedder,
    delay: std::time::Duration,
}

#[async_trait::async_trait]
impl Embedder for SlowEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, recall::EmbedError> {
        tokio::time::sleep(self.delay).await;
        self.inner.embed(text).await
    }
}

#[tokio::test]
async fn test_full_commit_resolve_cycle() {
    let coord = MemoryCoordinator::new(
        MemoryConfig::default(),
        Arc::new(HashEmbedder::default()),
    );

    // 首次解析：一无所知
    let miss = coord.resolve("ia emploi", chrono::Duration::hours(24)).await;
    assert!(matches!(miss, Resolution::Miss));

    // 管线跑完，写入结果
    coord
        .commit(
            "ia emploi",
            serde_json::json!({"report": "rapport final"}),
            vec![
                RawDoc::new(
                    "l'intelligence artificielle transforme le marché de l'emploi",
                    "Étude IA",
                    "https://example.org/etude",
                ),
                RawDoc::new(
                    "automatisation et reconversion professionnelle",
                    "Dossier emploi",
                    "https://example.org/dossier",
                ),
            ],
            keywords(&["ia", "emploi"]),
        )
        .await
        .unwrap();
    coord.record_conversation(
        "Recherche sur: ia emploi",
        "rapport final",
        HashMap::new(),
    );

    // 精确命中，含大小写/空白变体
    match coord.resolve("ia emploi", chrono::Duration::hours(24)).await {
        Resolution::ExactHit(v) => assert_eq!(v["report"], "rapport final"),
        other => panic!("expected exact hit, got {:?}", other),
    }
    match coord.resolve("IA EMPLOI ", chrono::Duration::hours(24)).await {
        Resolution::ExactHit(v) => assert_eq!(v["report"], "rapport final"),
        other => panic!("expected exact hit, got {:?}", other),
    }

    // 历史直通
    let history = coord.history(5);
    assert_eq!(history.len(), 1);
    assert!(history[0].user_text.contains("ia emploi"));

    // 语义检索直通
    let results = coord.search("intelligence artificielle emploi", 2, None).await.unwrap();
    assert!(!results.is_empty());
    assert!(results.windows(2).all(|w| w[0].1 >= w[1].1));
}

#[tokio::test]
async fn test_related_topic_resolution_after_other_commit() {
    let coord = MemoryCoordinator::new(
        MemoryConfig::default(),
        Arc::new(HashEmbedder::default()),
    );

    coord
        .commit(
            "intelligence artificielle emploi",
            serde_json::json!("R1"),
            vec![RawDoc::new(
                "intelligence artificielle et transformation de l'emploi",
                "Doc",
                "u",
            )],
            HashSet::new(),
        )
        .await
        .unwrap();

    // 不同主题键：缓存不命中，但语义软命中返回上下文
    let resolution = coord
        .resolve(
            "transformation emploi intelligence artificielle",
            chrono::Duration::hours(24),
        )
        .await;
    match resolution {
        Resolution::Related { context, topics } => {
            assert!(context.contains("Doc"));
            assert!(topics.contains(&"intelligence artificielle emploi".to_string()));
        }
        other => panic!("expected related, got {:?}", other),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_commits_on_distinct_topics_do_not_serialize() {
    let delay = std::time::Duration::from_millis(200);
    let coord = Arc::new(MemoryCoordinator::new(
        MemoryConfig::default(),
        Arc::new(SlowEmbedder {
            inner: HashEmbedder::default(),
            delay,
        }),
    ));

    let a = {
        let coord = Arc::clone(&coord);
        tokio::spawn(async move {
            coord
                .commit(
                    "sujet alpha",
                    serde_json::json!("A"),
                    vec![RawDoc::new("premier document du sujet alpha", "A", "ua")],
                    HashSet::new(),
                )
                .await
        })
    };
    let b = {
        let coord = Arc::clone(&coord);
        tokio::spawn(async move {
            coord
                .commit(
                    "sujet beta",
                    serde_json::json!("B"),
                    vec![RawDoc::new("second document du sujet beta", "B", "ub")],
                    HashSet::new(),
                )
                .await
        })
    };

    let start = std::time::Instant::now();
    let (ra, rb) = tokio::join!(a, b);
    ra.unwrap().unwrap();
    rb.unwrap().unwrap();
    let elapsed = start.elapsed();

    // 两次提交各含一次 200ms 的嵌入延迟；串行会超过 400ms
    assert!(
        elapsed < std::time::Duration::from_millis(380),
        "commits serialized: {:?}",
        elapsed
    );

    assert!(matches!(
        coord.resolve("sujet alpha", chrono::Duration::hours(24)).await,
        Resolution::ExactHit(_)
    ));
    assert!(matches!(
        coord.resolve("sujet beta", chrono::Duration::hours(24)).await,
        Resolution::ExactHit(_)
    ));
    assert_eq!(coord.store().len(), 2);
}
