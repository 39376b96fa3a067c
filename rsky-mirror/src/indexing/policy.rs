//! Admission rules. Each collection's rule is a read-only predicate over the
//! current index; none of them contacts a remote host.

use crate::db::IndexReader;
use crate::indexing::tracked::TrackedCache;
use crate::lexicon::TypedRecord;
use crate::record::Record;
use crate::types::MirrorError;

pub async fn should_index<R: IndexReader + ?Sized>(
    reader: &R,
    tracked: &TrackedCache,
    record: &Record,
) -> Result<bool, MirrorError> {
    let author = record.author();
    match record.value() {
        TypedRecord::Profile(_) | TypedRecord::Generator(_) => {
            tracked.is_tracked(reader, author).await
        }
        TypedRecord::Follow(follow) => {
            let sides = [author.to_owned(), follow.subject.clone()];
            Ok(!tracked.tracked_among(reader, &sides).await?.is_empty())
        }
        TypedRecord::Post(post) => {
            if tracked.is_tracked(reader, author).await? {
                return Ok(true);
            }
            if let Some(reply) = &post.reply {
                // thread continuity: replies into content we already hold
                if reader.is_post_indexed(&reply.parent.uri).await?
                    || reader.is_post_indexed(&reply.root.uri).await?
                {
                    return Ok(true);
                }
            }
            reader.has_tracked_follower(author).await
        }
        TypedRecord::Like(like) => Ok(tracked.is_tracked(reader, author).await?
            || reader.is_post_indexed(&like.subject.uri).await?),
        TypedRecord::Repost(_) => Ok(tracked.is_tracked(reader, author).await?
            || reader.has_tracked_follower(author).await?),
        TypedRecord::Subscription(_) => Ok(true),
    }
}
