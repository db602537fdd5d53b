//! XML helpers shared by the topic and object shells.
//!
//! Responses are assembled from small escaped fragments; request bodies
//! (bulk delete, multipart completion) are deserialized with quick-xml.

use quick_xml::escape::escape;

/// XML declaration prepended to every document.
pub const XML_DECL: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>";

/// `<name>escaped text</name>`
pub fn text_element(name: &str, value: &str) -> String {
    format!("<{name}>{}</{name}>", escape(value))
}

/// `<name>...children...</name>` where children are already rendered XML.
pub fn element(name: &str, children: &str) -> String {
    format!("<{name}>{children}</{name}>")
}

/// Escape a text value for embedding in an attribute or element.
pub fn text(value: &str) -> String {
    escape(value).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_element_escapes() {
        assert_eq!(
            text_element("Message", "a < b & c"),
            "<Message>a &lt; b &amp; c</Message>"
        );
    }

    #[test]
    fn test_element_nests_raw_children() {
        let inner = text_element("Code", "NoSuchKey");
        assert_eq!(
            element("Error", &inner),
            "<Error><Code>NoSuchKey</Code></Error>"
        );
    }
}
