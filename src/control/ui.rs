//! Static dashboard page
//!
//! A single self-contained HTML page that renders the status snapshot and
//! subscribes to the control WebSocket for live updates. No build step, no
//! external assets.

use axum::response::Html;

pub async fn dashboard() -> Html<&'static str> {
    Html(DASHBOARD_HTML)
}

const DASHBOARD_HTML: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<title>cloudburst</title>
<style>
  body { font-family: ui-monospace, monospace; background: #11151a; color: #d8dee9; margin: 2rem; }
  h1 { font-size: 1.2rem; }
  .row { display: flex; gap: 2rem; flex-wrap: wrap; }
  .card { background: #1b222b; border-radius: 8px; padding: 1rem 1.5rem; margin: .5rem 0; min-width: 16rem; }
  .state-running { color: #a3be8c; }
  .state-stopped { color: #bf616a; }
  .state-starting, .state-stopping { color: #ebcb8b; }
  .state-unknown { color: #b48ead; }
  .muted { color: #616e7f; }
  button { background: #2e3742; color: #d8dee9; border: 0; border-radius: 4px; padding: .4rem .8rem; margin-right: .4rem; cursor: pointer; }
  button:hover { background: #3b4654; }
  table { border-collapse: collapse; }
  td, th { padding: .2rem .8rem; text-align: left; }
</style>
</head>
<body>
<h1>cloudburst scaler</h1>
<div class="row">
  <div class="card">
    <div>mode: <b id="mode">-</b> &middot; <span id="paused"></span></div>
    <div>idle: <span id="idle">-</span>s <span class="muted" id="shutdown"></span></div>
    <div class="muted">uptime <span id="uptime">-</span>s</div>
  </div>
  <div class="card">
    <div>requests: <b id="requests">-</b></div>
    <div>cold starts: <b id="coldstarts">-</b> (<span id="blocked">-</span> blocked)</div>
    <div class="muted">fleet: <span id="fleet">-</span></div>
  </div>
  <div class="card">
    <button onclick="act('start')">start</button>
    <button onclick="act('stop')">stop</button>
    <button onclick="act('pause')">pause</button>
    <button onclick="act('resume')">resume</button>
    <div style="margin-top:.6rem">
      route:
      <button onclick="route('auto')">auto</button>
      <button onclick="route('local')">local</button>
      <button onclick="route('remote')">remote</button>
      <button onclick="route('mesh')">mesh</button>
    </div>
  </div>
</div>
<div class="card">
  <table id="workers"><thead><tr>
    <th>worker</th><th>kind</th><th>state</th><th>ready</th><th>url</th><th>models</th><th>requests</th>
  </tr></thead><tbody></tbody></table>
</div>
<script>
let ws;
function render(s) {
  document.getElementById('mode').textContent = s.mode;
  document.getElementById('paused').textContent = s.paused ? 'PAUSED' : '';
  document.getElementById('idle').textContent = s.idle_seconds;
  document.getElementById('shutdown').textContent =
    s.time_until_shutdown_secs != null ? '(shutdown in ' + s.time_until_shutdown_secs + 's)' : '';
  document.getElementById('uptime').textContent = s.uptime_secs;
  document.getElementById('requests').textContent = s.counters.requests_total;
  document.getElementById('coldstarts').textContent = s.counters.cold_start_count;
  document.getElementById('blocked').textContent = s.counters.requests_blocked_cold_start;
  document.getElementById('fleet').textContent =
    s.fleet.nodes_connected + '/' + s.fleet.nodes_total + ' nodes connected';
  const tbody = document.querySelector('#workers tbody');
  tbody.innerHTML = '';
  for (const w of s.workers) {
    const tr = document.createElement('tr');
    tr.innerHTML = '<td>' + w.name + '</td><td>' + w.kind + '</td>'
      + '<td class="state-' + w.state + '">' + w.state + '</td>'
      + '<td>' + (w.ready ? 'yes' : 'no') + '</td><td>' + w.url + '</td>'
      + '<td>' + (w.models || []).join(', ') + '</td><td>' + w.requests + '</td>';
    tbody.appendChild(tr);
  }
}
function act(action) {
  if (ws && ws.readyState === 1) ws.send(JSON.stringify({action}));
  else fetch('/_/' + action, {method: 'POST'});
}
function route(mode) {
  if (ws && ws.readyState === 1) ws.send(JSON.stringify({action: 'route', mode}));
  else fetch('/_/route?mode=' + mode, {method: 'POST'});
}
function connect() {
  const proto = location.protocol === 'https:' ? 'wss://' : 'ws://';
  ws = new WebSocket(proto + location.host + '/_/ws');
  ws.onmessage = (e) => render(JSON.parse(e.data));
  ws.onclose = () => setTimeout(connect, 2000);
}
fetch('/_/status').then(r => r.json()).then(render);
connect();
</script>
</body>
</html>
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dashboard_references_control_endpoints() {
        assert!(DASHBOARD_HTML.contains("/_/status"));
        assert!(DASHBOARD_HTML.contains("/_/ws"));
        assert!(DASHBOARD_HTML.contains("cold starts"));
    }
}
