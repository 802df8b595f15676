use futures_util::Stream;
use futures_util::stream::select_all;

use crate::engine::types::ExecutionEvent;

/// Fan several event streams into one, yielding events as they arrive.
///
/// Each input's own order is preserved. A quiet stream never holds back a
/// busy one, and there is no ordering across inputs.
pub fn merge<S>(streams: Vec<S>) -> impl Stream<Item = ExecutionEvent>
where
    S: Stream<Item = ExecutionEvent> + Unpin,
{
    select_all(streams)
}
