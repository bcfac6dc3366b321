use strand_types::ToolCall;

use crate::native;
use crate::xml::XmlToolParser;

/// Finish reason reported when the per-response XML tool-call cap fired.
pub const XML_TOOL_LIMIT_REACHED: &str = "xml_tool_limit_reached";

/// All tool invocations found in one assistant response, native calls first
/// (provider order) then XML calls in order of appearance.
#[derive(Debug, Default)]
pub struct ParsedResponse {
    pub tool_calls: Vec<ToolCall>,
    pub xml_limit_reached: bool,
}

impl ParsedResponse {
    /// The finish reason this parse overrides onto the containing response,
    /// if any.
    pub fn finish_reason_override(&self) -> Option<&'static str> {
        self.xml_limit_reached.then_some(XML_TOOL_LIMIT_REACHED)
    }
}

pub fn parse_response(
    content: &str,
    native_calls: Vec<ToolCall>,
    xml_parser: &XmlToolParser,
) -> ParsedResponse {
    let mut tool_calls = native_calls;
    native::ensure_ids(&mut tool_calls);

    let extraction = xml_parser.extract(content);
    tool_calls.extend(extraction.calls);

    ParsedResponse {
        tool_calls,
        xml_limit_reached: extraction.limit_reached,
    }
}
