//! Drives paged provider listings to completion.

use std::future::Future;

use spore_core::{Page, Pagination};
use spore_provider::ProviderResult;

/// Fetch every page of a listing, starting from page 1.
///
/// Stops when the provider reports no further page, or when a page comes
/// back empty even though the reported total claims more. The first
/// error aborts the walk.
pub async fn collect_pages<T, F, Fut>(page_size: u32, mut fetch: F) -> ProviderResult<Vec<T>>
where
    F: FnMut(Pagination) -> Fut,
    Fut: Future<Output = ProviderResult<Page<T>>>,
{
    let mut pagination = Pagination::first(page_size);
    let mut items = Vec::new();

    loop {
        let page = fetch(pagination).await?;
        let next = page.next_page();
        if page.items.is_empty() {
            break;
        }
        items.extend(page.items);
        match next {
            Some(next) => pagination = next,
            None => break,
        }
    }

    Ok(items)
}
