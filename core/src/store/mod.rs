/// In-memory stores owned by the aggregation state
pub mod conversations;
pub mod history;
pub mod nodes;
