/// Outcome of a user-supplied step that can be interrupted by the abort token.
pub(crate) enum HookDecision<T> {
    Finished(T),
    Cancelled,
}
