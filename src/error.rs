use thiserror::Error;

/// Failures that can surface from the page provider up through every tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocError {
  /// The operating system refused to map more pages.
  #[error("the operating system refused to map {pages} pages")]
  OutOfMemory { pages: usize },
  /// The request cannot be expressed as a page count.
  #[error("a request of {size} bytes overflows the address space")]
  SizeOverflow { size: usize },
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn messages_name_the_quantity() {
    let oom = AllocError::OutOfMemory { pages: 127 };
    assert_eq!(oom.to_string(), "the operating system refused to map 127 pages");

    let overflow = AllocError::SizeOverflow { size: usize::MAX };
    assert!(overflow.to_string().contains(&usize::MAX.to_string()));
  }
}
