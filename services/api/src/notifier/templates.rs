use super::EmailMessage;

pub const CONFIRMATION_SUBJECT: &str = "Your Detailers University course purchase";
pub const CREDENTIALS_SUBJECT: &str = "Your Detailers University login details";
pub const SALE_SUBJECT: &str = "New course sale";

fn escape_html(input: &str) -> String {
    let mut escaped = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

fn layout(title: &str, content: &str) -> String {
    format!(
        r##"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <title>{title}</title>
</head>
<body style="margin: 0; padding: 0; font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, Arial, sans-serif; background-color: #f4f4f5; color: #18181b;">
    <table role="presentation" style="width: 100%; border-collapse: collapse;">
        <tr>
            <td style="padding: 40px 20px;">
                <table role="presentation" style="max-width: 600px; margin: 0 auto; background: #ffffff; border-radius: 12px; border: 1px solid #e4e4e7;">
                    <tr>
                        <td style="padding: 32px 40px 16px; border-bottom: 1px solid #e4e4e7;">
                            <span style="font-size: 20px; font-weight: 700;">Detailers University</span>
                        </td>
                    </tr>
                    <tr>
                        <td style="padding: 32px 40px; font-size: 16px; line-height: 1.6;">
                            {content}
                        </td>
                    </tr>
                </table>
            </td>
        </tr>
    </table>
</body>
</html>"##
    )
}

/// Purchase confirmation sent to the buyer once payment is confirmed
pub fn purchase_confirmation(
    to: &str,
    customer_name: &str,
    course_title: &str,
    access_code: &str,
) -> EmailMessage {
    let text = format!(
        "Hi {customer_name},\n\n\
         Thank you for purchasing \"{course_title}\". Your payment has been confirmed.\n\n\
         Your access code is: {access_code}\n\n\
         Keep this code; you can use it to look up your purchase at any time.\n\n\
         Detailers University"
    );

    let html = layout(
        CONFIRMATION_SUBJECT,
        &format!(
            r#"<p>Hi {name},</p>
                            <p>Thank you for purchasing <strong>{course}</strong>. Your payment has been confirmed.</p>
                            <p>Your access code is:</p>
                            <p style="font-size: 24px; font-weight: 700; letter-spacing: 2px;"><code>{code}</code></p>
                            <p style="color: #71717a;">Keep this code; you can use it to look up your purchase at any time.</p>"#,
            name = escape_html(customer_name),
            course = escape_html(course_title),
            code = escape_html(access_code),
        ),
    );

    EmailMessage {
        to: to.to_string(),
        subject: CONFIRMATION_SUBJECT.to_string(),
        body_text: text,
        body_html: Some(html),
    }
}

/// One-time login credentials for a newly created or reset account
pub fn credentials(
    to: &str,
    customer_name: &str,
    password: &str,
    login_url: &str,
) -> EmailMessage {
    let text = format!(
        "Hi {customer_name},\n\n\
         An account has been set up for you on Detailers University.\n\n\
         Email: {to}\n\
         Password: {password}\n\n\
         Sign in at {login_url} and change your password after your first login.\n\n\
         Detailers University"
    );

    let html = layout(
        CREDENTIALS_SUBJECT,
        &format!(
            r#"<p>Hi {name},</p>
                            <p>An account has been set up for you on Detailers University.</p>
                            <p><strong>Email:</strong> {email}<br><strong>Password:</strong> <code>{password}</code></p>
                            <p><a href="{login_url}" style="display: inline-block; background: #2563eb; color: #ffffff; text-decoration: none; font-weight: 600; padding: 12px 24px; border-radius: 8px;">Sign in</a></p>
                            <p style="color: #71717a;">Please change your password after your first login.</p>"#,
            name = escape_html(customer_name),
            email = escape_html(to),
            password = escape_html(password),
            login_url = escape_html(login_url),
        ),
    );

    EmailMessage {
        to: to.to_string(),
        subject: CREDENTIALS_SUBJECT.to_string(),
        body_text: text,
        body_html: Some(html),
    }
}

/// Heads-up to the instructor/staff inbox about a completed sale
pub fn sale_notification(
    to: &str,
    course_title: &str,
    customer_name: &str,
    customer_email: &str,
) -> EmailMessage {
    EmailMessage {
        to: to.to_string(),
        subject: format!("{SALE_SUBJECT}: {course_title}"),
        body_text: format!(
            "\"{course_title}\" was purchased by {customer_name} <{customer_email}>."
        ),
        body_html: None,
    }
}
