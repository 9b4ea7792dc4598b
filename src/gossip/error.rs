use failure::Fail;

/// Represents each reason why a gossip message could be faulty.
#[derive(Clone, Debug, Fail, PartialEq)]
pub enum FaultKind {
    /// `Gossip` received a subscription for an identifier that is not a
    /// current group member.
    #[fail(display = "`Gossip` received a `Subscribe` for a non-member.")]
    UnknownSubscriber,
}
