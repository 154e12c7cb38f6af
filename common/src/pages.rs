use std::fmt::Write as _;

use crate::{networks::ScannedNetwork, types::DashboardView};

pub const SETUP_AP_SSID: &str = "FormDisplay-Setup";

const STYLE: &str = r#"<style>
body{font-family:Arial,sans-serif;max-width:720px;margin:2rem auto;padding:0 1rem;color:#111}
.card{border:1px solid #ddd;border-radius:8px;padding:1rem;margin-bottom:1rem}
.big{font-size:3rem;font-weight:bold;margin:.2rem 0}.muted{color:#555}
label{display:block;margin:.5rem 0 .2rem}input,select{width:100%;padding:.5rem;box-sizing:border-box}
button{padding:.55rem .9rem;margin-top:.8rem}table{width:100%;border-collapse:collapse}
td,th{padding:.25rem;border-bottom:1px solid #eee;text-align:right}td:first-child,th:first-child{text-align:left}
.pos{color:#106010}.neg{color:#a00000}
</style>"#;

pub fn form_zone(form: i32) -> &'static str {
    match form {
        i32::MIN..=-31 => "High risk",
        -30..=-11 => "Optimal",
        -10..=4 => "Grey zone",
        5..=20 => "Fresh",
        _ => "Transition",
    }
}

pub fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(ch),
        }
    }
    out
}

fn head(out: &mut String, title: &str) {
    let _ = write!(
        out,
        "<!doctype html><html lang=\"en\"><head><meta charset=\"utf-8\">\
         <meta name=\"viewport\" content=\"width=device-width, initial-scale=1\">\
         <title>{title}</title>{STYLE}</head><body><h1>{title}</h1>"
    );
}

pub fn render_dashboard(view: &DashboardView) -> String {
    let mut out = String::with_capacity(4096);
    head(&mut out, "Form");

    out.push_str("<div class=\"card\">");
    match &view.current {
        Some(record) => {
            let class = if record.form >= 0 { "pos" } else { "neg" };
            let _ = write!(
                out,
                "<p class=\"muted\">{date}</p><p class=\"big {class}\">{form:+}</p>\
                 <p>{zone}</p><p>Fitness (CTL) {ctl} &middot; Fatigue (ATL) {atl}</p>",
                date = record.date,
                form = record.form,
                zone = form_zone(record.form),
                ctl = record.ctl,
                atl = record.atl,
            );
        }
        None => out.push_str("<p class=\"muted\">No data yet.</p>"),
    }
    out.push_str(
        "<button id=\"refresh\">Refresh now</button><div id=\"status\" class=\"muted\"></div></div>",
    );

    if !view.history.is_empty() {
        out.push_str(
            "<div class=\"card\"><h2>Last days</h2><table>\
             <tr><th>Date</th><th>CTL</th><th>ATL</th><th>Form</th></tr>",
        );
        for record in view.history.iter().rev() {
            let _ = write!(
                out,
                "<tr><td>{}</td><td>{}</td><td>{}</td><td>{:+}</td></tr>",
                record.date, record.ctl, record.atl, record.form
            );
        }
        out.push_str("</table></div>");
    }

    let last_fetch = view
        .last_scheduled_fetch
        .map(|date| date.to_string())
        .unwrap_or_else(|| "never".to_string());
    let _ = write!(
        out,
        "<div class=\"card\"><h2>Daily refresh</h2>\
         <p class=\"muted\">Last scheduled fetch: {last_fetch}{sync}</p>\
         <form method=\"post\" action=\"/saveschedule\">\
         <label>Time</label><input name=\"time\" type=\"time\" value=\"{time}\">\
         <label>UTC offset (hours)</label><input name=\"tz\" type=\"number\" min=\"-12\" max=\"14\" value=\"{offset}\">\
         <button type=\"submit\">Save schedule</button></form></div>",
        sync = if view.time_synced { "" } else { " (clock not synced)" },
        time = escape_html(&view.schedule_time),
        offset = escape_html(view.utc_offset.trim_start_matches('+')),
    );

    let _ = write!(
        out,
        "<div class=\"card\"><h2>Analytics account</h2>\
         <p class=\"muted\">API key: {key}</p>\
         <form method=\"post\" action=\"/saveapi\">\
         <label>API key</label><input name=\"apikey\" type=\"password\" placeholder=\"unchanged if empty\">\
         <label>Athlete id</label><input name=\"athleteid\" type=\"text\" value=\"{athlete}\">\
         <button type=\"submit\">Save</button></form></div>",
        key = if view.api_key_set { "set" } else { "not set" },
        athlete = escape_html(&view.athlete_id),
    );

    out.push_str(
        "<div class=\"card\"><form method=\"post\" action=\"/reset\" \
         onsubmit=\"return confirm('Erase all settings?')\">\
         <button type=\"submit\">Factory reset</button></form></div>\
         <script>\
         document.getElementById('refresh').addEventListener('click',async()=>{\
         const s=document.getElementById('status');s.textContent='Refreshing...';\
         try{const r=await fetch('/api/form');const b=await r.json();\
         if(b.success){location.reload();}else{s.textContent=b.error;}}\
         catch(e){s.textContent=e.message;}});\
         </script></body></html>",
    );
    out
}

pub fn render_setup(networks: &[ScannedNetwork]) -> String {
    let mut out = String::with_capacity(2048);
    head(&mut out, "Form Display Setup");

    out.push_str(
        "<div class=\"card\"><p class=\"muted\">Choose the WiFi network this display should join.</p>\
         <form method=\"post\" action=\"/connect\"><label>Network</label>",
    );
    if networks.is_empty() {
        out.push_str("<input name=\"ssid\" type=\"text\" placeholder=\"SSID\">");
    } else {
        out.push_str("<select name=\"ssid\">");
        for network in networks {
            let ssid = escape_html(&network.ssid);
            let _ = write!(
                out,
                "<option value=\"{ssid}\">{ssid} ({rssi} dBm{lock})</option>",
                rssi = network.rssi,
                lock = if network.secure { ", secured" } else { "" },
            );
        }
        out.push_str("</select>");
    }
    out.push_str(
        "<label>Password</label><input name=\"password\" type=\"password\">\
         <button type=\"submit\">Connect</button></form></div></body></html>",
    );
    out
}

pub fn render_message(title: &str, message: &str) -> String {
    let mut out = String::new();
    head(&mut out, &escape_html(title));
    let _ = write!(
        out,
        "<div class=\"card\"><p>{}</p></div></body></html>",
        escape_html(message)
    );
    out
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;
    use crate::history::FormRecord;

    fn view(current: Option<FormRecord>) -> DashboardView {
        DashboardView {
            current,
            history: current.into_iter().collect(),
            schedule_time: "07:00".to_string(),
            utc_offset: "+2".to_string(),
            athlete_id: "i<42>".to_string(),
            api_key_set: true,
            last_scheduled_fetch: None,
            time_synced: true,
        }
    }

    #[test]
    fn zones_cover_boundaries() {
        assert_eq!(form_zone(-31), "High risk");
        assert_eq!(form_zone(-30), "Optimal");
        assert_eq!(form_zone(-10), "Grey zone");
        assert_eq!(form_zone(-11), "Optimal");
        assert_eq!(form_zone(4), "Grey zone");
        assert_eq!(form_zone(5), "Fresh");
        assert_eq!(form_zone(20), "Fresh");
        assert_eq!(form_zone(21), "Transition");
    }

    #[test]
    fn dashboard_shows_current_form_and_escapes_input() {
        let record = FormRecord::from_loads(NaiveDate::from_ymd_opt(2025, 1, 2).unwrap(), 43.1, 39.5);
        let html = render_dashboard(&view(Some(record)));

        assert!(html.contains(">+3<"));
        assert!(html.contains("Grey zone"));
        assert!(html.contains("i&lt;42&gt;"));
        assert!(html.contains("value=\"2\""));
        assert!(html.contains("Last scheduled fetch: never"));
    }

    #[test]
    fn dashboard_without_data_says_so() {
        let html = render_dashboard(&view(None));
        assert!(html.contains("No data yet."));
        assert!(!html.contains("<table>"));
    }

    #[test]
    fn setup_lists_networks() {
        let html = render_setup(&[ScannedNetwork {
            ssid: "Home \"5G\"".to_string(),
            rssi: -48,
            secure: true,
        }]);
        assert!(html.contains("Home &quot;5G&quot; (-48 dBm, secured)"));
        assert!(html.contains("action=\"/connect\""));
    }
}
