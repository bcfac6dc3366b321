//! Extraction of tool invocations from assistant responses.
//!
//! Native tool calls arrive pre-structured from the provider and pass
//! through; XML tool calls are embedded in the textual content as registered
//! top-level tags and are extracted here.

pub mod native;
pub mod response;
pub mod xml;

pub use native::{ensure_ids, from_provider};
pub use response::{parse_response, ParsedResponse, XML_TOOL_LIMIT_REACHED};
pub use xml::{XmlExtraction, XmlToolParser};
