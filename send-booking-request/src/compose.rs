use crate::{
    mailchannels::{ContentPart, EmailAddress, OutboundMessage, Personalization},
    ValidatedBooking,
};
use chrono::NaiveDate;
use serde::Serialize;
use tinytemplate::TinyTemplate;

const FROM_EMAIL: &str = "no-reply@barloventodelpacificotours.com";
const FROM_NAME: &str = "Barlovento Website";
const GUEST_FROM_NAME: &str = "Barlovento Reservations";
const GUEST_SUBJECT: &str = "We received your booking request";

const MISSING_PHONE_PLACEHOLDER: &str = "—";
const MISSING_MESSAGE_PLACEHOLDER: &str = "(none)";
const MISSING_DATE_PLACEHOLDER: &str = "?";

const INTERNAL_TEMPLATE_NAME: &str = "internal-notification";
const GUEST_TEMPLATE_NAME: &str = "guest-acknowledgement";
const INTERNAL_TEMPLATE: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/assets/internal-notification.html"
));
const GUEST_TEMPLATE: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/assets/guest-acknowledgement.html"
));

/// Delivery targets for the internal notification. Ordered, deduplicated,
/// with blind-copy recipients never overlapping the primary list.
pub struct RecipientSet {
    to: Vec<String>,
    bcc: Vec<String>,
}

impl RecipientSet {
    pub fn from_environment() -> Self {
        Self::from_lists(
            &std::env::var("TO_EMAILS").unwrap_or_default(),
            &std::env::var("BCC_EMAILS").unwrap_or_default(),
        )
    }

    pub fn from_lists(to: &str, bcc: &str) -> Self {
        let to = parse_email_list(to);
        let bcc = parse_email_list(bcc)
            .into_iter()
            .filter(|address| !to.contains(address))
            .collect();
        Self { to, bcc }
    }

    pub fn is_empty(&self) -> bool {
        self.to.is_empty()
    }

    /// The address guest replies should reach.
    pub fn primary(&self) -> Option<&str> {
        self.to.first().map(String::as_str)
    }

    pub fn to(&self) -> &[String] {
        &self.to
    }

    pub fn bcc(&self) -> &[String] {
        &self.bcc
    }
}

fn parse_email_list(raw: &str) -> Vec<String> {
    let mut addresses: Vec<String> = Vec::new();
    for address in raw.split(',').map(str::trim).filter(|a| !a.is_empty()) {
        if !addresses.iter().any(|seen| seen == address) {
            addresses.push(address.into());
        }
    }
    addresses
}

/// Renders an ISO calendar date like "Aug 16, 2025". The date is a plain
/// calendar day, so no timezone is involved. An empty value renders as a
/// placeholder and an unparseable one passes through as submitted; display
/// formatting never fails a request.
pub fn format_calendar_date(raw: &str) -> String {
    if raw.is_empty() {
        return MISSING_DATE_PLACEHOLDER.into();
    }
    match NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        Ok(date) => date.format("%b %d, %Y").to_string(),
        Err(_) => raw.into(),
    }
}

pub fn format_requested_dates(start: Option<&str>, end: Option<&str>) -> String {
    match (start, end) {
        (None, None) => MISSING_DATE_PLACEHOLDER.into(),
        (Some(date), None) | (None, Some(date)) => format_calendar_date(date),
        (Some(start), Some(end)) if start == end => format_calendar_date(start),
        (Some(start), Some(end)) => format!(
            "{} to {}",
            format_calendar_date(start),
            format_calendar_date(end)
        ),
    }
}

pub fn internal_notification(
    booking: &ValidatedBooking,
    recipients: &RecipientSet,
    requested_dates: &str,
) -> OutboundMessage {
    let guest_name = format!("{} {}", booking.first_name, booking.last_name);
    let text = format!(
        "New Booking Request\n\
         \n\
         Name: {guest_name}\n\
         Email: {email}\n\
         Phone: {phone}\n\
         Requested date: {requested_dates}\n\
         \n\
         Message:\n\
         {message}\n",
        email = booking.email,
        phone = booking.phone.unwrap_or(MISSING_PHONE_PLACEHOLDER),
        message = booking.message.unwrap_or(MISSING_MESSAGE_PLACEHOLDER),
    );
    let html = render_html(
        INTERNAL_TEMPLATE_NAME,
        INTERNAL_TEMPLATE,
        &BookingContext::new(booking, requested_dates),
    );
    OutboundMessage {
        personalizations: vec![Personalization {
            to: recipients.to().iter().map(EmailAddress::new).collect(),
            bcc: if recipients.bcc().is_empty() {
                None
            } else {
                Some(recipients.bcc().iter().map(EmailAddress::new).collect())
            },
        }],
        from: EmailAddress::named(FROM_EMAIL, FROM_NAME),
        subject: format!(
            "Booking Request — {guest_name} — {email}",
            email = booking.email
        ),
        reply_to: EmailAddress::named(booking.email, guest_name),
        content: vec![ContentPart::plain(text), ContentPart::html(html)],
    }
}

/// The acknowledgement deliberately avoids confirming the booking; it only
/// confirms receipt of the request.
pub fn guest_acknowledgement(
    booking: &ValidatedBooking,
    recipients: &RecipientSet,
    requested_dates: &str,
) -> OutboundMessage {
    let guest_name = format!("{} {}", booking.first_name, booking.last_name);
    let text = format!(
        "Hi {first_name},\n\
         \n\
         Thanks for contacting Barlovento del Pacífico Tours!\n\
         We have received your booking request and will review availability.\n\
         We will get back to you soon to confirm details or ask any questions.\n\
         \n\
         Request summary\n\
         - Name: {guest_name}\n\
         - Email: {email}\n\
         - Phone: {phone}\n\
         - Requested date: {requested_dates}\n\
         \n\
         If you need to update anything, just reply to this email.\n\
         \n\
         Barlovento del Pacífico Tours\n",
        first_name = booking.first_name,
        email = booking.email,
        phone = booking.phone.unwrap_or(MISSING_PHONE_PLACEHOLDER),
    );
    let html = render_html(
        GUEST_TEMPLATE_NAME,
        GUEST_TEMPLATE,
        &BookingContext::new(booking, requested_dates),
    );
    OutboundMessage {
        personalizations: vec![Personalization {
            to: vec![EmailAddress::named(booking.email, guest_name)],
            bcc: None,
        }],
        from: EmailAddress::named(FROM_EMAIL, GUEST_FROM_NAME),
        subject: GUEST_SUBJECT.into(),
        reply_to: EmailAddress::named(
            recipients.primary().unwrap_or(FROM_EMAIL),
            GUEST_FROM_NAME,
        ),
        content: vec![ContentPart::plain(text), ContentPart::html(html)],
    }
}

#[derive(Serialize)]
struct BookingContext<'a> {
    first_name: &'a str,
    last_name: &'a str,
    email: &'a str,
    phone: &'a str,
    requested_dates: &'a str,
    message: Option<&'a str>,
    message_display: &'a str,
}

impl<'a> BookingContext<'a> {
    fn new(booking: &'a ValidatedBooking, requested_dates: &'a str) -> Self {
        Self {
            first_name: booking.first_name,
            last_name: booking.last_name,
            email: booking.email,
            phone: booking.phone.unwrap_or(MISSING_PHONE_PLACEHOLDER),
            requested_dates,
            message: booking.message,
            message_display: booking.message.unwrap_or(MISSING_MESSAGE_PLACEHOLDER),
        }
    }
}

// The default tinytemplate formatter escapes &, <, >, " and ', which is the
// whole escaping contract for the HTML renderings. Plain-text parts are
// assembled with format! above and stay verbatim.
fn render_html(
    template_name: &'static str,
    template: &'static str,
    context: &BookingContext,
) -> String {
    let mut tt = TinyTemplate::new();
    tt.add_template(template_name, template).unwrap();
    tt.render(template_name, context).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use googletest::prelude::*;

    const MALICIOUS_CONTENT: &str = r#"<script>doEvil("&")</script>"#;

    fn arbitrary_booking<'a>() -> ValidatedBooking<'a> {
        ValidatedBooking {
            first_name: "Ana",
            last_name: "Araya",
            email: "guest@example.com",
            phone: Some("+506 8888 8888"),
            date: Some("2025-08-16"),
            date_end: None,
            message: Some("Two adults, one child."),
            turnstile_token: Some("arbitrary token"),
        }
    }

    fn arbitrary_recipients() -> RecipientSet {
        RecipientSet::from_lists("reservations@example.com,owner@example.com", "")
    }

    fn part_value(message: &OutboundMessage, index: usize) -> &str {
        &message.content[index].value
    }

    #[test]
    fn formats_iso_date_in_short_month_form() -> Result<()> {
        verify_that!(format_calendar_date("2025-08-16"), eq("Aug 16, 2025"))
    }

    #[test]
    fn pads_single_digit_days() -> Result<()> {
        verify_that!(format_calendar_date("2025-08-06"), eq("Aug 06, 2025"))
    }

    #[test]
    fn renders_placeholder_for_empty_date() -> Result<()> {
        verify_that!(format_calendar_date(""), eq("?"))
    }

    #[test]
    fn passes_unparseable_date_through() -> Result<()> {
        verify_that!(format_calendar_date("mid August"), eq("mid August"))
    }

    #[test]
    fn renders_placeholder_when_no_date_given() -> Result<()> {
        verify_that!(format_requested_dates(None, None), eq("?"))
    }

    #[test]
    fn renders_single_date_without_range() -> Result<()> {
        verify_that!(
            format_requested_dates(Some("2025-08-16"), None),
            eq("Aug 16, 2025")
        )
    }

    #[test]
    fn renders_date_range() -> Result<()> {
        verify_that!(
            format_requested_dates(Some("2025-08-16"), Some("2025-08-20")),
            eq("Aug 16, 2025 to Aug 20, 2025")
        )
    }

    #[test]
    fn collapses_range_with_equal_endpoints() -> Result<()> {
        verify_that!(
            format_requested_dates(Some("2025-08-16"), Some("2025-08-16")),
            eq("Aug 16, 2025")
        )
    }

    #[test]
    fn deduplicates_recipients_preserving_order() -> Result<()> {
        let recipients =
            RecipientSet::from_lists("a@example.com, b@example.com,a@example.com", "");

        verify_that!(
            recipients.to().iter().map(String::as_str).collect::<Vec<_>>(),
            elements_are![eq("a@example.com"), eq("b@example.com")]
        )
    }

    #[test]
    fn excludes_primary_recipients_from_blind_copies() -> Result<()> {
        let recipients = RecipientSet::from_lists(
            "a@example.com,b@example.com",
            "b@example.com,c@example.com,c@example.com",
        );

        verify_that!(
            recipients.bcc().iter().map(String::as_str).collect::<Vec<_>>(),
            elements_are![eq("c@example.com")]
        )
    }

    #[test]
    fn empty_recipient_list_is_reported_empty() -> Result<()> {
        verify_that!(RecipientSet::from_lists(" , ", "x@example.com").is_empty(), eq(true))
    }

    #[test]
    fn internal_notification_addresses_configured_recipients() -> Result<()> {
        let message = internal_notification(
            &arbitrary_booking(),
            &arbitrary_recipients(),
            "Aug 16, 2025",
        );

        verify_that!(
            message.personalizations[0]
                .to
                .iter()
                .map(|address| address.email.as_str())
                .collect::<Vec<_>>(),
            elements_are![eq("reservations@example.com"), eq("owner@example.com")]
        )
    }

    #[test]
    fn internal_notification_omits_empty_bcc() -> Result<()> {
        let message = internal_notification(
            &arbitrary_booking(),
            &arbitrary_recipients(),
            "Aug 16, 2025",
        );

        verify_that!(message.personalizations[0].bcc.is_none(), eq(true))
    }

    #[test]
    fn internal_notification_serializes_without_bcc_key_when_empty() -> Result<()> {
        let message = internal_notification(
            &arbitrary_booking(),
            &arbitrary_recipients(),
            "Aug 16, 2025",
        );

        let serialized = serde_json::to_string(&message).unwrap();

        verify_that!(serialized, not(contains_substring("bcc")))
    }

    #[test]
    fn internal_notification_replies_to_guest() -> Result<()> {
        let message = internal_notification(
            &arbitrary_booking(),
            &arbitrary_recipients(),
            "Aug 16, 2025",
        );

        verify_that!(message.reply_to.email, eq("guest@example.com"))
    }

    #[test]
    fn internal_subject_names_guest_and_email() -> Result<()> {
        let message = internal_notification(
            &arbitrary_booking(),
            &arbitrary_recipients(),
            "Aug 16, 2025",
        );

        verify_that!(
            message.subject,
            all!(
                contains_substring("Ana Araya"),
                contains_substring("guest@example.com")
            )
        )
    }

    #[test]
    fn internal_bodies_carry_phone_and_date() -> Result<()> {
        let message = internal_notification(
            &arbitrary_booking(),
            &arbitrary_recipients(),
            "Aug 16, 2025",
        );

        verify_that!(
            part_value(&message, 0),
            all!(
                contains_substring("Phone: +506 8888 8888"),
                contains_substring("Requested date: Aug 16, 2025")
            )
        )?;
        verify_that!(
            part_value(&message, 1),
            all!(
                contains_substring("+506 8888 8888"),
                contains_substring("Aug 16, 2025")
            )
        )
    }

    #[test]
    fn internal_bodies_use_placeholders_for_optional_fields() -> Result<()> {
        let booking = ValidatedBooking {
            phone: None,
            message: None,
            ..arbitrary_booking()
        };

        let message = internal_notification(&booking, &arbitrary_recipients(), "?");

        verify_that!(
            part_value(&message, 0),
            all!(contains_substring("Phone: —"), contains_substring("(none)"))
        )
    }

    #[test]
    fn escapes_user_input_in_internal_html_body() -> Result<()> {
        let booking = ValidatedBooking {
            message: Some(MALICIOUS_CONTENT),
            ..arbitrary_booking()
        };

        let message = internal_notification(&booking, &arbitrary_recipients(), "Aug 16, 2025");

        verify_that!(
            part_value(&message, 1),
            all!(
                not(contains_substring(MALICIOUS_CONTENT)),
                contains_substring("&lt;script&gt;"),
                contains_substring("&amp;")
            )
        )
    }

    #[test]
    fn keeps_user_input_verbatim_in_internal_text_body() -> Result<()> {
        let booking = ValidatedBooking {
            message: Some(MALICIOUS_CONTENT),
            ..arbitrary_booking()
        };

        let message = internal_notification(&booking, &arbitrary_recipients(), "Aug 16, 2025");

        verify_that!(part_value(&message, 0), contains_substring(MALICIOUS_CONTENT))
    }

    #[test]
    fn escapes_user_input_in_guest_html_body() -> Result<()> {
        let booking = ValidatedBooking {
            first_name: MALICIOUS_CONTENT,
            ..arbitrary_booking()
        };

        let message = guest_acknowledgement(&booking, &arbitrary_recipients(), "Aug 16, 2025");

        verify_that!(part_value(&message, 1), not(contains_substring(MALICIOUS_CONTENT)))
    }

    #[test]
    fn guest_acknowledgement_goes_to_guest_only() -> Result<()> {
        let message = guest_acknowledgement(
            &arbitrary_booking(),
            &arbitrary_recipients(),
            "Aug 16, 2025",
        );

        verify_that!(message.personalizations[0].to.len(), eq(1))?;
        verify_that!(
            message.personalizations[0].to[0].email,
            eq("guest@example.com")
        )
    }

    #[test]
    fn guest_acknowledgement_replies_to_primary_recipient() -> Result<()> {
        let message = guest_acknowledgement(
            &arbitrary_booking(),
            &arbitrary_recipients(),
            "Aug 16, 2025",
        );

        verify_that!(message.reply_to.email, eq("reservations@example.com"))
    }

    #[test]
    fn guest_acknowledgement_confirms_receipt_not_booking() -> Result<()> {
        let message = guest_acknowledgement(
            &arbitrary_booking(),
            &arbitrary_recipients(),
            "Aug 16, 2025",
        );

        verify_that!(message.subject, eq("We received your booking request"))?;
        verify_that!(
            part_value(&message, 0),
            contains_substring("received your booking request")
        )
    }

    #[test]
    fn guest_html_omits_message_block_when_no_message_given() -> Result<()> {
        let booking = ValidatedBooking {
            message: None,
            ..arbitrary_booking()
        };

        let message = guest_acknowledgement(&booking, &arbitrary_recipients(), "Aug 16, 2025");

        verify_that!(part_value(&message, 1), not(contains_substring("Your message")))
    }
}
