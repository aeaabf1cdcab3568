use std::collections::BTreeSet;

use crate::mail_reader::message::Envelope;

/// Allow-list of sender addresses, compared case-insensitively.
///
/// Only the address portion takes part in matching; display names are ignored.
#[derive(Debug, Clone, Default)]
pub struct SenderFilter {
    addresses: BTreeSet<String>,
}

impl SenderFilter {
    pub fn new<I, S>(addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        SenderFilter {
            addresses: addresses
                .into_iter()
                .map(|a| normalize(a.as_ref()))
                .filter(|a| !a.is_empty())
                .collect(),
        }
    }

    pub fn addresses(&self) -> impl Iterator<Item = &str> {
        self.addresses.iter().map(String::as_str)
    }

    pub fn matches_address(&self, address: &str) -> bool {
        self.addresses.contains(&normalize(address))
    }

    /// Whether the envelope's first From address is allowed.
    pub fn matches(&self, envelope: &Envelope) -> bool {
        envelope
            .sender()
            .is_some_and(|sender| self.matches_address(&sender.email))
    }
}

fn normalize(address: &str) -> String {
    address.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mail_reader::message::MailAddress;

    fn envelope_from(email: &str, name: Option<&str>) -> Envelope {
        Envelope {
            from: vec![MailAddress {
                name: name.map(str::to_string),
                email: email.to_string(),
            }],
            ..Default::default()
        }
    }

    #[test]
    fn matching_ignores_case() {
        let filter = SenderFilter::new(["board@org.example"]);
        assert!(filter.matches(&envelope_from("Board@Org.Example", None)));
        assert!(!filter.matches(&envelope_from("someone@org.example", None)));
    }

    #[test]
    fn configured_addresses_are_normalized() {
        let filter = SenderFilter::new([" Board@ORG.example ", ""]);
        assert_eq!(filter.addresses().collect::<Vec<_>>(), vec!["board@org.example"]);
    }

    #[test]
    fn display_name_does_not_take_part() {
        let filter = SenderFilter::new(["board@org.example"]);
        assert!(filter.matches(&envelope_from("board@org.example", Some("Spoofed Name"))));
        assert!(!filter.matches(&envelope_from("x@evil.example", Some("board@org.example"))));
    }

    #[test]
    fn envelope_without_sender_never_matches() {
        let filter = SenderFilter::new(["board@org.example"]);
        assert!(!filter.matches(&Envelope::default()));
        assert_eq!(SenderFilter::default().addresses().count(), 0);
    }
}
