pub mod graph;
pub mod oauth;

pub use graph::{GraphClient, GraphError, GraphProfile, GraphUser, StoryStatus};
pub use oauth::{InstagramOAuthClient, LongLivedToken, OAuthError, ShortLivedToken};
