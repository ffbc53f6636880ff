use super::{AgentProfile, StageSpec};
use crate::tools::ToolKind;

pub const SCRAPE: &str = "scrape";
pub const RESEARCH: &str = "research";
pub const WRITE: &str = "write";

/// The scrape → research → write chain, in execution order.
pub fn listing_stages() -> Vec<StageSpec> {
    vec![scrape_stage(), research_stage(), write_stage()]
}

fn scrape_stage() -> StageSpec {
    StageSpec {
        name: SCRAPE,
        agent: AgentProfile {
            role: "Web Scraper",
            goal: "Extract data from product detail pages and report it to the next agent.",
            backstory: "You are an expert web scraper with extensive experience in e-commerce \
                data extraction. You are known for your attention to detail and for spotting the \
                product specifications, pricing patterns and positioning cues that others miss.",
            temperature: 0.2,
        },
        instruction: "Scrape the product information from the web page at {url}.\n\
            Extract the following details:\n\
            - title: the name of the product.\n\
            - description: a brief summary of the product.\n\
            - category: the store category the product is listed under.\n\
            - color: the available colors of the product.\n\
            - size: the dimensions or size variations of the product.\n\
            - count: the number of items included in a package.\n\
            Then determine the type of product and its potential use.\n\
            If a detail is not available, set it to null.\n\
            Do not invent or create new data. Only extract information present on the given page.",
        expected_output: r#"A JSON object and nothing else:
{
    "title": "...",
    "description": "...",
    "category": "...",
    "color": "...",
    "size": "...",
    "count": "...",
    "product_type": "..."
}"#,
        tools: &[ToolKind::ScrapePage, ToolKind::WebSearch],
    }
}

fn research_stage() -> StageSpec {
    StageSpec {
        name: RESEARCH,
        agent: AgentProfile {
            role: "Market Researcher",
            goal: "Analyze product data, identify competitors, and determine the most valuable and \
                trending keywords for optimal market positioning.",
            backstory: "You are an expert market researcher with extensive experience in \
                e-commerce competition analysis. Your process: analyze the product details \
                received from the scraper, identify the main keywords the product competes \
                for, analyze competitors and the keywords they use, and research trending, \
                high-value keywords.",
            temperature: 0.3,
        },
        instruction: "Take the product dictionary from the previous task and analyze it.\n\
            Step 1, product analysis: identify the main keywords and phrases that describe the \
            product, the key features that differentiate it, the target audience, and direct and \
            indirect competitors.\n\
            Step 2, market research: use the search results provided to find trending and \
            high-value keywords, the main keywords competitor products use, and the language the \
            target audience engages with.\n\
            Step 3, report: compile the findings into a structured report.\n\
            Derive keywords and competitors only from the product data and the search results; \
            do not invent them.",
        expected_output: r#"A JSON object and nothing else:
{
    "product_keywords": ["...", "..."],
    "key_features": ["...", "..."],
    "target_audience": "...",
    "competitors": ["...", "..."],
    "trending_keywords": ["...", "..."],
    "competitor_keywords": ["...", "..."],
    "audience_keywords": ["...", "..."]
}"#,
        tools: &[ToolKind::WebSearch],
    }
}

fn write_stage() -> StageSpec {
    StageSpec {
        name: WRITE,
        agent: AgentProfile {
            role: "SEO Expert",
            goal: "Use the research report to write an SEO friendly product title and description.",
            backstory: "You are an expert title builder with extensive experience in e-commerce, \
                known for the creativity and language skills that put products in the spotlight. \
                You turn keyword research into copy that ranks and that customers understand.",
            temperature: 0.4,
        },
        instruction: "Take the report from the previous task and write an SEO-optimized product \
            title and description.\n\
            Title requirements:\n\
            - exactly 80 characters, no more, no less;\n\
            - SEO-friendly, built from relevant keywords in the report;\n\
            - clear and easy for customers to understand;\n\
            - do not include the brand name.\n\
            Description requirements:\n\
            - exactly 4 paragraphs of at most 3 sentences each;\n\
            - no more than 400 words;\n\
            - use the best keywords from the report naturally;\n\
            - highlight key features, benefits and unique selling points, with one paragraph on \
            the value proposition;\n\
            - only use information from the research report, do not add external context.",
        expected_output: r#"A JSON object and nothing else:
{
    "title": "Exactly 80-character product title...",
    "description": "Exactly 4 paragraphs product description..."
}"#,
        tools: &[],
    }
}
