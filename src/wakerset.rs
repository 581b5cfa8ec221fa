use std::{collections::HashMap, default::Default, num::NonZeroUsize, task::Waker};

#[derive(Debug, Eq, PartialEq, Hash)]
pub(crate) struct Token(NonZeroUsize);

impl Token {
    fn duplicate(&self) -> Token {
        Token(self.0)
    }
}

/// Data structure for managing a collection of wakers that are all interested
/// in a single shared batch. It is designed so that only a single task needs
/// to actually do the work of driving the batch (its window, then its fetch)
/// to completion, while the other tasks sleep until the results are ready.
///
/// Wakers can be added to a wakerset; when added, a token associated with the
/// Waker is returned. This token should be associated with a waiting future
/// and can be used to:
/// - replace the waker on subsequent polls
/// - discard the waker from the wakerset.
/// These tokens cannot be cloned or otherwise duplicated; this helps to ensure
/// that their lifespan are correctly associated with a particular task.
///
/// The WakerSet maintains the notion of the "driving waker". The first waker
/// added to an undriven set becomes the driver, and stays the driver until it
/// is discarded. If the driving waker is discarded from the set, another is
/// selected and awoken so that it can take over. So long as futures take care
/// to discard their stored tokens when dropped, the shared batch always has a
/// path forward.
#[derive(Debug)]
pub(crate) struct WakerSet {
    wakers: HashMap<Token, Waker>,
    driving_waker: Option<Token>,

    // Tokens are an ever-increasing integer. We assume that WakerSets are
    // relatively short-lived and that there's no chance of running out of
    // these.
    next_token: NonZeroUsize,
}

impl Default for WakerSet {
    fn default() -> Self {
        Self {
            wakers: HashMap::with_capacity(1),
            next_token: NonZeroUsize::new(1).unwrap(),
            driving_waker: None,
        }
    }
}

impl WakerSet {
    /// Add a new waker to this set. Return the token associated with this
    /// waker's entry in the set. If the set has no driver, this waker becomes
    /// the driver.
    #[must_use]
    pub(crate) fn add_waker(&mut self, waker: Waker) -> Token {
        let token = Token(self.next_token);
        self.next_token = self
            .next_token
            .get()
            .checked_add(1)
            .and_then(NonZeroUsize::new)
            .expect("Overflow when creating token");

        self.wakers.insert(token.duplicate(), waker);
        if self.driving_waker.is_none() {
            self.driving_waker = Some(token.duplicate());
        }
        token
    }

    /// Set a waker with an existing token in this set. Panics if the token
    /// is not present in the set. The waker is passed by reference and is set
    /// with clone_from because we assume that it comes from a Context and
    /// will need to be cloned anyway. If the set has no driver, this waker
    /// claims that role.
    pub(crate) fn replace_waker(&mut self, token: &Token, waker: &Waker) {
        self.wakers
            .get_mut(token)
            .expect("Attempted to add Waker to WakerSet with an invalid token")
            .clone_from(waker);

        if self.driving_waker.is_none() {
            self.driving_waker = Some(token.duplicate());
        }
    }

    /// Upsert the waker for a polling future, and report whether that future
    /// is the one responsible for driving the shared work.
    pub(crate) fn register(&mut self, slot: &mut Option<Token>, waker: &Waker) -> bool {
        match slot {
            Some(token) => self.replace_waker(token, waker),
            None => *slot = Some(self.add_waker(waker.clone())),
        }

        slot.as_ref() == self.driving_waker.as_ref()
    }

    /// Upsert the waker for a polling future and make it the driver. Used by
    /// the future that dispatches the batch, which then polls the fetch
    /// itself; the previous driver is woken with everyone else when the
    /// results are ready.
    pub(crate) fn claim_driver(&mut self, slot: &mut Option<Token>, waker: &Waker) {
        match slot {
            Some(token) => self.replace_waker(token, waker),
            None => *slot = Some(self.add_waker(waker.clone())),
        }

        self.driving_waker = slot.as_ref().map(Token::duplicate);
    }

    /// Wake the driving waker, if any. Used when the batch window is closed
    /// early, so that the driver dispatches without waiting for its timer.
    pub(crate) fn wake_driver(&self) {
        if let Some(waker) = self
            .driving_waker
            .as_ref()
            .and_then(|token| self.wakers.get(token))
        {
            waker.wake_by_ref();
        }
    }

    /// Discard a waker from this set. If that waker was the current driving
    /// waker, an arbitrary waker is made the current driving waker and
    /// awoken.
    ///
    /// We create a new driving waker immediately because if a series of drops
    /// happen at the same time we need to ensure that at least one non-dropped
    /// waker is awoken.
    pub(crate) fn discard_and_wake(&mut self, token: Token) {
        self.wakers.remove(&token);
        if self.driving_waker == Some(token) || self.driving_waker.is_none() {
            match self.wakers.iter().next() {
                None => self.driving_waker = None,
                Some((token, waker)) => {
                    self.driving_waker = Some(token.duplicate());
                    waker.wake_by_ref();
                }
            }
        }
    }

    /// Discard our own waker and wake every other one. Used by the driving
    /// future once the batch is done; it is about to take its own result, so
    /// it doesn't need to be woken.
    pub(crate) fn discard_wake_all(mut self, token: Token) {
        self.wakers.remove(&token);
        self.wake_all();
    }

    pub(crate) fn wake_all(self) {
        self.wakers
            .into_iter()
            .for_each(|(_token, waker)| waker.wake());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::task::noop_waker;

    #[test]
    fn first_registered_waker_drives() {
        let mut set = WakerSet::default();
        let waker = noop_waker();

        let mut first = None;
        let mut second = None;
        assert!(set.register(&mut first, &waker));
        assert!(!set.register(&mut second, &waker));

        // Re-polling doesn't move the driver role around
        assert!(!set.register(&mut second, &waker));
        assert!(set.register(&mut first, &waker));
    }

    #[test]
    fn discarding_the_driver_hands_off() {
        let mut set = WakerSet::default();
        let waker = noop_waker();

        let mut first = None;
        let mut second = None;
        set.register(&mut first, &waker);
        set.register(&mut second, &waker);

        set.discard_and_wake(first.take().unwrap());
        assert!(set.register(&mut second, &waker));
    }

    #[test]
    fn claiming_takes_over_the_driver_role() {
        let mut set = WakerSet::default();
        let waker = noop_waker();

        let mut first = None;
        let mut second = None;
        set.register(&mut first, &waker);
        set.claim_driver(&mut second, &waker);

        assert!(!set.register(&mut first, &waker));
        assert!(set.register(&mut second, &waker));
    }
}
