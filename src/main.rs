use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use job_pool::{HashCache, JobContext, JobError, JobPool, PoolConfig};

/// A catalogue entry as stored: child categories are referenced by name.
struct Category {
    name: &'static str,
    level: u32,
    subcategories: &'static [&'static str],
}

/// A category with its whole subtree resolved.
#[derive(Debug, Clone, Serialize)]
struct ExpandedCategory {
    name: String,
    level: u32,
    image: Option<String>,
    subcategories: Vec<ExpandedCategory>,
}

const CATALOGUE: &[Category] = &[
    Category {
        name: "category-1",
        level: 0,
        subcategories: &["sub-category-1"],
    },
    Category {
        name: "category-2",
        level: 0,
        subcategories: &["sub-category-1", "sub-category-2"],
    },
    Category {
        name: "category-3",
        level: 0,
        subcategories: &["sub-category-3", "sub-category-4", "sub-category-5"],
    },
    Category {
        name: "sub-category-1",
        level: 1,
        subcategories: &["sub-sub-category-5"],
    },
    Category {
        name: "sub-category-2",
        level: 1,
        subcategories: &["sub-sub-category-4"],
    },
    Category {
        name: "sub-category-3",
        level: 1,
        subcategories: &["sub-sub-category-3"],
    },
    Category {
        name: "sub-category-4",
        level: 1,
        subcategories: &["sub-sub-category-2"],
    },
    Category {
        name: "sub-category-5",
        level: 1,
        subcategories: &["sub-sub-category-1"],
    },
    Category {
        name: "sub-sub-category-1",
        level: 2,
        subcategories: &[],
    },
    Category {
        name: "sub-sub-category-2",
        level: 2,
        subcategories: &[],
    },
    Category {
        name: "sub-sub-category-3",
        level: 2,
        subcategories: &[],
    },
    Category {
        name: "sub-sub-category-4",
        level: 2,
        subcategories: &[],
    },
    Category {
        name: "sub-sub-category-5",
        level: 2,
        subcategories: &[],
    },
];

const IMAGES: &[&str] = &[
    "/img/category-1",
    "/img/category-2",
    "/img/sub-category-1",
    "/img/sub-category-2",
    "/img/sub-category-4",
    "/img/sub-category-5",
    "/img/sub-sub-category-3",
];

/// Simulated lookup latency per category.
const LOOKUP_LATENCY: Duration = Duration::from_millis(25);

async fn expand(
    name: String,
    ctx: JobContext<String, ExpandedCategory>,
) -> Result<ExpandedCategory, JobError> {
    tokio::select! {
        _ = ctx.cancelled() => return Err(JobError::aborted("lookup cancelled")),
        _ = tokio::time::sleep(LOOKUP_LATENCY) => {}
    }

    let category = CATALOGUE
        .iter()
        .find(|c| c.name == name)
        .ok_or_else(|| JobError::upstream(format!("unknown category: {name}")))?;

    let children = ctx
        .spawn_many(category.subcategories.iter().map(|child| child.to_string()))
        .await
        .into_iter()
        .collect::<Result<Vec<_>, _>>()?;

    let image = format!("/img/{name}");
    Ok(ExpandedCategory {
        image: IMAGES.contains(&image.as_str()).then_some(image),
        name,
        level: category.level,
        subcategories: children,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = PoolConfig::from_env()?;
    let cache = Arc::new(HashCache::new());
    let pool = JobPool::builder(expand)
        .config(config)
        .cache(Arc::clone(&cache))
        .build()?;

    let roots: Vec<String> = CATALOGUE
        .iter()
        .filter(|c| c.level == 0)
        .map(|c| c.name.to_string())
        .collect();

    let started = tokio::time::Instant::now();
    let results = pool.resolve_all(roots).await;
    let expanded = results.into_iter().collect::<Result<Vec<_>, _>>()?;

    println!("{}", serde_json::to_string_pretty(&expanded)?);
    eprintln!(
        "Resolved {} categories ({} distinct) in {:?}",
        expanded.len(),
        cache.len(),
        started.elapsed()
    );

    Ok(())
}
