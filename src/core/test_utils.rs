//! Arena ownership for unit tests that build a session by hand.

#[cfg(test)]
pub mod test {
    use crate::core::session::CompilationSession;
    use bumpalo::Bump;

    /// Owns the arena a test session borrows.
    #[derive(Default)]
    pub struct TestContext {
        arena: Bump,
    }

    impl TestContext {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn create_session(&self) -> CompilationSession<'_> {
            CompilationSession::new(&self.arena)
        }
    }
}
