use thiserror::Error;

/// Element-scoped failures. None of these abort a page: the element or link
/// is dropped and the walk continues.
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("<{tag}> has no extractable text")]
    EmptyText { tag: String },

    #[error("cannot resolve href {href:?}: {source}")]
    MalformedHref {
        href: String,
        #[source]
        source: url::ParseError,
    },
}
